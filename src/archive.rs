//! zip 解压：条目路径与请求路径同样不可信，先整体校验再写入。

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::ApiError;
use crate::storage::{Storage, StorageError, is_within, resolve_within};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Default, Serialize)]
pub struct ExtractSummary {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

struct PlannedEntry {
    index: usize,
    name: String,
    target: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
}

/// 解压卷内的 zip 文件到其所在目录。
pub async fn extract_in_place(
    storage: &Storage,
    relative: &str,
) -> Result<ExtractSummary, ApiError> {
    let archive = storage.resolve_path_checked(relative, false).await?;
    let metadata = tokio::fs::metadata(&archive)
        .await
        .map_err(StorageError::from)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("extract target is a directory".into()));
    }
    let destination = archive
        .parent()
        .filter(|parent| is_within(storage.root_path(), parent))
        .map(Path::to_path_buf)
        .ok_or(StorageError::BoundaryViolation)?;

    let summary = tokio::task::spawn_blocking(move || extract_zip(&archive, &destination))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;

    info!(
        path = relative,
        files = summary.files,
        directories = summary.directories,
        bytes = summary.bytes,
        "extract archive"
    );
    Ok(summary)
}

/// 阻塞执行。任一条目越界则整体拒绝且不写入；写入阶段遇到首个 IO 错误即停止，已写出的条目保留。
pub fn extract_zip(archive: &Path, destination: &Path) -> Result<ExtractSummary, StorageError> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(zip_error)?;

    let mut plan = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index).map_err(zip_error)?;
        let name = entry.name().to_string();
        let mode = entry.unix_mode();
        if mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
            warn!(entry = name, "archive contains a symlink entry");
            return Err(StorageError::BoundaryViolation);
        }
        let target = resolve_within(destination, &name).inspect_err(|_| {
            warn!(entry = name, "archive entry escapes the destination");
        })?;
        if target == destination {
            continue;
        }
        plan.push(PlannedEntry {
            index,
            is_dir: entry.is_dir(),
            name,
            target,
            mode,
        });
    }

    let mut summary = ExtractSummary::default();
    for planned in plan {
        ensure_no_symlinks(destination, &planned.target)?;
        if planned.is_dir {
            fs::create_dir_all(&planned.target)?;
            summary.directories += 1;
            continue;
        }
        if let Some(parent) = planned.target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entry = zip.by_index(planned.index).map_err(zip_error)?;
        let expected = entry.size();
        let mut out = File::create(&planned.target)?;
        let copied = io::copy(&mut entry, &mut out)?;
        out.sync_all()?;
        if copied != expected {
            return Err(StorageError::InvalidArchive(format!(
                "entry {} is truncated ({copied} of {expected} bytes)",
                planned.name
            )));
        }
        apply_mode(&planned.target, planned.mode)?;
        debug!(entry = planned.name, bytes = copied, "extracted entry");
        summary.files += 1;
        summary.bytes += copied;
    }

    Ok(summary)
}

/// 已存在的中间路径不得是符号链接，避免借助卷内链接写出目标目录。
fn ensure_no_symlinks(destination: &Path, target: &Path) -> Result<(), StorageError> {
    let relative = target
        .strip_prefix(destination)
        .map_err(|_| StorageError::BoundaryViolation)?;
    let mut current = destination.to_path_buf();
    for component in relative.components() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(StorageError::BoundaryViolation);
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StorageError::Io(err)),
        }
    }
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match mode.map(|mode| mode & 0o777) {
        Some(bits) if bits != 0 => fs::set_permissions(path, fs::Permissions::from_mode(bits | 0o600)),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

fn zip_error(err: ZipError) -> StorageError {
    match err {
        ZipError::Io(err) => StorageError::Io(err),
        other => StorageError::InvalidArchive(other.to_string()),
    }
}
