//! multipart 上传处理：请求体先限长再解析，流式写入临时文件后原子替换。

use axum::body::Body as AxumBody;
use axum::extract::multipart::MultipartError;
use axum::extract::{FromRequest, Multipart};
use axum::http::{HeaderMap, Request, StatusCode};
use http_body_util::{LengthLimitError, Limited};
use serde::Serialize;
use std::error::Error as StdError;
use tokio::fs;
use tracing::{debug, info};

use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::http::declared_content_length;
use crate::storage::{Storage, StorageError, join_relative};

pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug)]
pub struct UploadConfig {
    /// 请求体（上传或编辑）的最大字节数。
    pub max_size: u64,
}

#[derive(Debug, Serialize)]
pub struct UploadOutcome {
    pub path: String,
    pub size: u64,
}

/// 请求体超过上限时直接拒绝，不进入解析。
pub fn check_declared_length(headers: &HeaderMap, upload: &UploadConfig) -> Result<(), ApiError> {
    if let Some(length) = declared_content_length(headers)
        && length > upload.max_size
    {
        return Err(ApiError::PayloadTooLarge(upload.max_size));
    }
    Ok(())
}

/// 将 multipart 字段 `file` 保存到 `relative` 指向的目录，使用原始文件名。
pub async fn upload_multipart(
    storage: &Storage,
    upload: &UploadConfig,
    relative: &str,
    request: Request<AxumBody>,
) -> Result<UploadOutcome, ApiError> {
    check_declared_length(request.headers(), upload)?;

    let target_dir = storage.resolve_path_checked(relative, true).await?;
    match fs::metadata(&target_dir).await {
        Ok(metadata) if !metadata.is_dir() => return Err(StorageError::NotADirectory.into()),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(StorageError::Io(err).into()),
    }

    let limit = usize::try_from(upload.max_size).unwrap_or(usize::MAX);
    let (parts, body) = request.into_parts();
    let body = AxumBody::new(Limited::new(body, limit));
    let mut multipart = Multipart::from_request(Request::from_parts(parts, body), &())
        .await
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(err, upload))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field
            .file_name()
            .and_then(sanitize_file_name)
            .ok_or_else(|| ApiError::BadRequest("upload is missing a file name".into()))?;
        let target_relative = join_relative(relative, &file_name);
        let target = storage.resolve_path_checked(&target_relative, true).await?;

        fs::create_dir_all(&target_dir)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;

        let mut atomic = AtomicFile::new(&target).await?;
        let write_result: Result<(), ApiError> = async {
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|err| multipart_error(err, upload))?
            {
                if atomic.written() + chunk.len() as u64 > upload.max_size {
                    return Err(ApiError::PayloadTooLarge(upload.max_size));
                }
                atomic.write_chunk(&chunk).await?;
            }
            Ok(())
        }
        .await;
        if let Err(err) = write_result {
            debug!(path = target_relative, error = %err, "upload aborted");
            atomic.cleanup().await;
            return Err(err);
        }
        let size = atomic.finalize().await?;

        info!(path = target_relative, size, "upload file");
        return Ok(UploadOutcome {
            path: target_relative,
            size,
        });
    }

    Err(ApiError::BadRequest(format!(
        "multipart field `{UPLOAD_FIELD}` is required"
    )))
}

fn multipart_error(err: MultipartError, upload: &UploadConfig) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE || hit_length_limit(&err) {
        ApiError::PayloadTooLarge(upload.max_size)
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

/// 限长错误可能被多层 body 包装，逐级检查 source 链。
fn hit_length_limit(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.downcast_ref::<LengthLimitError>().is_some()
            || err.to_string().contains("length limit exceeded")
        {
            return true;
        }
        current = err.source();
    }
    false
}

/// 只保留客户端文件名的最后一段。
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    match name {
        "" | "." | ".." => None,
        name if name.contains('\0') => None,
        name => Some(name.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::Body as AxumBody;
    use axum::http::{Request, header};

    const BOUNDARY: &str = "XUPLOADBOUNDARYX";

    pub(crate) fn multipart_body(field: &str, file_name: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    pub(crate) fn multipart_request(uri: &str, body: Vec<u8>) -> Request<AxumBody> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(AxumBody::from(body))
            .expect("request")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{multipart_body, multipart_request};
    use super::*;
    use axum::http::header;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("data");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Arc::new(Storage::new(root)))
    }

    #[tokio::test]
    async fn upload_creates_directory_and_file() {
        let (_temp, storage) = make_storage();
        let upload = UploadConfig { max_size: 1024 };
        let request = multipart_request("/plugins", multipart_body("file", "motd.txt", b"hi"));

        let outcome = upload_multipart(&storage, &upload, "plugins", request)
            .await
            .expect("upload");

        assert_eq!(outcome.path, "plugins/motd.txt");
        assert_eq!(outcome.size, 2);
        let written = std::fs::read(storage.root_path().join("plugins/motd.txt")).expect("read");
        assert_eq!(written, b"hi");
    }

    #[tokio::test]
    async fn upload_strips_client_directories_from_file_name() {
        let (_temp, storage) = make_storage();
        let upload = UploadConfig { max_size: 1024 };
        let request = multipart_request(
            "/",
            multipart_body("file", "../../evil.txt", b"x"),
        );

        let outcome = upload_multipart(&storage, &upload, "", request)
            .await
            .expect("upload");

        assert_eq!(outcome.path, "evil.txt");
        assert!(storage.root_path().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn upload_without_file_field_is_bad_request() {
        let (_temp, storage) = make_storage();
        let upload = UploadConfig { max_size: 1024 };
        let request = multipart_request("/", multipart_body("other", "a.txt", b"x"));

        let result = upload_multipart(&storage, &upload, "", request).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert_eq!(
            std::fs::read_dir(storage.root_path()).expect("dir").count(),
            0
        );
    }

    #[tokio::test]
    async fn oversized_upload_writes_nothing() {
        let (_temp, storage) = make_storage();
        let upload = UploadConfig { max_size: 16 };
        let request = multipart_request("/", multipart_body("file", "big.bin", &[7u8; 64]));

        let result = upload_multipart(&storage, &upload, "", request).await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(16))));
        assert_eq!(
            std::fs::read_dir(storage.root_path()).expect("dir").count(),
            0
        );
    }

    #[tokio::test]
    async fn oversized_body_without_length_is_cut_while_streaming() {
        let (_temp, storage) = make_storage();
        let upload = UploadConfig { max_size: 100 };
        let mut request =
            multipart_request("/", multipart_body("file", "big.bin", &[1u8; 4096]));
        request.headers_mut().remove(header::CONTENT_LENGTH);

        let result = upload_multipart(&storage, &upload, "", request).await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(100))));
        assert!(!storage.root_path().join("big.bin").exists());
    }

    #[test]
    fn sanitize_keeps_last_component() {
        assert_eq!(sanitize_file_name("world.zip").as_deref(), Some("world.zip"));
        assert_eq!(
            sanitize_file_name("C:\\Users\\me\\world.zip").as_deref(),
            Some("world.zip")
        );
        assert_eq!(sanitize_file_name("dir/.."), None);
        assert_eq!(sanitize_file_name(""), None);
    }
}
