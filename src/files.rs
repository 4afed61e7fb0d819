//! 目录列表、下载、编辑、建目录与删除处理。

use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::conditional::{Validators, check_write_preconditions};
use crate::http::prefers_html;
use crate::render::{EditView, PageView, render_page};
use crate::storage::{Storage, StorageError, join_relative};
use crate::upload::{UploadConfig, check_declared_length};

/// 编辑目标：请求路径为目录时取其下的 `name`，否则取请求路径所在目录下的 `name`。
pub struct EditTarget {
    pub dir_relative: String,
    pub relative: String,
    pub path: PathBuf,
}

pub async fn resolve_edit_target(
    storage: &Storage,
    relative: &str,
    name: &str,
) -> Result<EditTarget, ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::BadRequest("edit name is required".into()));
    }
    let resolved = storage.resolve(relative)?;
    let dir_relative = match fs::metadata(&resolved).await {
        Ok(metadata) if metadata.is_dir() => relative.to_string(),
        _ => parent_relative(relative).to_string(),
    };
    let target_relative = join_relative(&dir_relative, name);
    let path = storage.resolve_path_checked(&target_relative, true).await?;
    let relative = storage.relative_of(&path)?;
    Ok(EditTarget {
        dir_relative,
        relative,
        path,
    })
}

fn parent_relative(relative: &str) -> &str {
    relative.rsplit_once('/').map_or("", |(parent, _)| parent)
}

/// GET：目录返回列表（JSON 或页面），文件返回下载流；浏览器带 `edit` 时返回编辑页面。
pub async fn get_entry(
    storage: &Storage,
    relative: &str,
    edit: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let html = prefers_html(headers);
    if let Some(name) = edit.filter(|_| html) {
        return edit_view(storage, relative, name).await;
    }

    let target = storage.resolve_path_checked(relative, false).await?;
    let metadata = fs::metadata(&target).await.map_err(StorageError::from)?;
    if !metadata.is_dir() {
        return download_file(&target, relative, &metadata, headers).await;
    }

    let entries = storage.list_resolved(&target).await?;
    info!(path = relative, count = entries.len(), "list files");
    if html {
        let page = render_page(&PageView {
            current_path: relative,
            entries: &entries,
            edit: None,
        });
        return Ok(Html(page).into_response());
    }
    Ok(JsonResponse(entries).into_response())
}

async fn edit_view(storage: &Storage, relative: &str, name: &str) -> Result<Response, ApiError> {
    let target = resolve_edit_target(storage, relative, name).await?;
    let metadata = fs::metadata(&target.path)
        .await
        .map_err(StorageError::from)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("edit target is a directory".into()));
    }
    let bytes = fs::read(&target.path).await.map_err(StorageError::from)?;
    let content = String::from_utf8_lossy(&bytes);
    let entries = storage.list_dir(&target.dir_relative).await?;
    info!(path = target.relative, size = bytes.len(), "open editor");
    let page = render_page(&PageView {
        current_path: &target.dir_relative,
        entries: &entries,
        edit: Some(EditView {
            name,
            content: &content,
        }),
    });
    Ok(Html(page).into_response())
}

/// 下载文件，支持 Range、If-Range、If-None-Match 与 If-Modified-Since。
pub async fn download_file(
    target: &Path,
    relative: &str,
    metadata: &std::fs::Metadata,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let file_size = metadata.len();
    let mime = mime_guess::from_path(target).first_or_octet_stream();
    let validators = Validators::from_metadata(metadata);

    let mut response_headers = validator_headers(&validators)?;
    if validators.is_not_modified(request_headers) {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }
    response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = if validators.range_applies(request_headers) {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(target).await.map_err(StorageError::from)?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = relative, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {}-{}/{}", start, end, file_size))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(
        header::CONTENT_LENGTH,
        header_value(&file_size.to_string())?,
    );
    info!(path = relative, size = file_size, "download full file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 以请求体整体替换编辑目标的内容。
pub async fn write_edit(
    storage: &Storage,
    upload: &UploadConfig,
    relative: &str,
    name: &str,
    headers: &HeaderMap,
    body: AxumBody,
) -> Result<Response, ApiError> {
    check_declared_length(headers, upload)?;
    let target = resolve_edit_target(storage, relative, name).await?;
    let metadata = match fs::metadata(&target.path).await {
        Ok(metadata) => Some(metadata),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };
    if metadata.as_ref().is_some_and(|metadata| metadata.is_dir()) {
        return Err(ApiError::BadRequest("edit target is a directory".into()));
    }
    let current = metadata.as_ref().map(Validators::from_metadata);
    check_write_preconditions(headers, current.as_ref())?;

    if let Some(parent) = target.path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    let mut atomic = AtomicFile::new(&target.path).await?;
    let write_result: Result<(), ApiError> = async {
        let mut data_stream = BodyExt::into_data_stream(body);
        while let Some(chunk) = data_stream.next().await {
            let chunk = chunk.map_err(|err: AxumError| ApiError::Internal(err.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            if atomic.written() + chunk.len() as u64 > upload.max_size {
                return Err(ApiError::PayloadTooLarge(upload.max_size));
            }
            atomic.write_chunk(&chunk).await?;
        }
        Ok(())
    }
    .await;
    if let Err(err) = write_result {
        atomic.cleanup().await;
        return Err(err);
    }
    let size = atomic.finalize().await?;
    info!(path = target.relative, size, "write file");

    created_response(&target.path).await
}

/// 201 响应，附带新内容的 ETag 与 Last-Modified。
pub async fn created_response(path: &Path) -> Result<Response, ApiError> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let response_headers = validator_headers(&Validators::from_metadata(&metadata))?;
    Ok((StatusCode::CREATED, response_headers).into_response())
}

fn validator_headers(validators: &Validators) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, header_value(validators.etag())?);
    if let Some(value) = validators.last_modified() {
        headers.insert(header::LAST_MODIFIED, header_value(&value)?);
    }
    Ok(headers)
}

/// 删除文件或目录。
pub async fn delete_entry(storage: &Storage, relative: &str) -> Result<StatusCode, ApiError> {
    storage.delete_path(relative).await?;
    info!(path = relative, "delete entry");
    Ok(StatusCode::NO_CONTENT)
}

/// 创建目录（含父级）。
pub async fn create_directory(storage: &Storage, relative: &str) -> Result<StatusCode, ApiError> {
    storage.create_dir(relative).await?;
    info!(path = relative, "create directory");
    Ok(StatusCode::CREATED)
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default();
    let end_part = parts.next().unwrap_or_default();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Ok(None);
        }
        let start = file_size.saturating_sub(suffix);
        (start, file_size.saturating_sub(1))
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size.saturating_sub(1)
        } else {
            end_part
                .parse::<u64>()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
                .min(file_size.saturating_sub(1))
        };
        (start, end)
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end)))
}
