//! 请求分发：按方法与查询参数选择操作，统一记录失败请求。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Query};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Redirect, Response};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};

use crate::archive::extract_in_place;
use crate::error::ApiError;
use crate::files::{create_directory, created_response, delete_entry, get_entry, write_edit};
use crate::http::{is_multipart, prefers_html};
use crate::render::dir_href;
use crate::storage::{Storage, normalize_relative};
use crate::upload::{UploadConfig, upload_multipart};

const MKCOL: &str = "MKCOL";

#[derive(Debug, Default, Deserialize)]
pub struct OperationQuery {
    edit: Option<String>,
    extract: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Operation {
    /// 目录列表、文件下载或（浏览器）编辑页面。
    Read { edit: Option<String> },
    Upload,
    Edit { name: String },
    Extract,
    MakeDirectory,
    Delete,
}

impl Operation {
    /// `edit` 标记优先，其次 `extract`，最后按 content-type 识别 multipart。
    pub fn select(
        method: &Method,
        query: OperationQuery,
        headers: &HeaderMap,
    ) -> Result<Self, ApiError> {
        let edit = query.edit.filter(|name| !name.is_empty());
        let extract = query
            .extract
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));

        match *method {
            Method::GET | Method::HEAD => Ok(Operation::Read { edit }),
            Method::POST | Method::PUT => {
                if let Some(name) = edit {
                    Ok(Operation::Edit { name })
                } else if extract {
                    Ok(Operation::Extract)
                } else if is_multipart(headers) {
                    Ok(Operation::Upload)
                } else {
                    Err(ApiError::BadRequest(
                        "expected a multipart upload, `?edit=<name>` or `?extract=true`".into(),
                    ))
                }
            }
            Method::DELETE => Ok(Operation::Delete),
            ref other if other.as_str() == MKCOL => Ok(Operation::MakeDirectory),
            _ => Err(ApiError::MethodNotAllowed),
        }
    }
}

/// 将请求路径解码并清理为卷内相对路径。
pub fn decode_request_path(raw: &str) -> Result<String, ApiError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ApiError::BadRequest("path is not valid UTF-8".into()))?;
    Ok(normalize_relative(&decoded)?)
}

/// 所有路径与方法的统一入口。
pub async fn handle_request(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    request: Request<AxumBody>,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match dispatch(&storage, &upload, request).await {
        Ok(response) => response,
        Err(err) => {
            let status = err.status();
            if status.is_server_error() {
                error!(method = %method, path, status = status.as_u16(), error = %err, "request error");
            } else {
                warn!(method = %method, path, status = status.as_u16(), error = %err, "request rejected");
            }
            err.into_response()
        }
    }
}

async fn dispatch(
    storage: &Storage,
    upload: &UploadConfig,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let relative = decode_request_path(request.uri().path())?;
    let Query(query) = Query::<OperationQuery>::try_from_uri(request.uri())
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let operation = Operation::select(request.method(), query, request.headers())?;

    match operation {
        Operation::Read { edit } => {
            get_entry(storage, &relative, edit.as_deref(), request.headers()).await
        }
        Operation::Upload => {
            let html = prefers_html(request.headers());
            let outcome = upload_multipart(storage, upload, &relative, request).await?;
            if html {
                return Ok(Redirect::to(&dir_href(&relative)).into_response());
            }
            let target = storage.resolve(&outcome.path)?;
            let (parts, _) = created_response(&target).await?.into_parts();
            Ok((parts.status, parts.headers, JsonResponse(outcome)).into_response())
        }
        Operation::Edit { name } => {
            let (parts, body) = request.into_parts();
            write_edit(storage, upload, &relative, &name, &parts.headers, body).await
        }
        Operation::Extract => {
            let summary = extract_in_place(storage, &relative).await?;
            Ok((StatusCode::OK, JsonResponse(summary)).into_response())
        }
        Operation::MakeDirectory => Ok(create_directory(storage, &relative)
            .await?
            .into_response()),
        Operation::Delete => Ok(delete_entry(storage, &relative).await?.into_response()),
    }
}
