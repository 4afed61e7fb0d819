//! 卷根目录沙箱：路径解析、目录列表、删除与建目录。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::ErrorKind;

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// 创建（如缺失）并规范化卷根目录。
    pub async fn open(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self::new(fs::canonicalize(&root).await?))
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }

    /// 纯路径运算，不访问文件系统。
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        resolve_within(&self.root, relative)
    }

    pub async fn resolve_path_checked(
        &self,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let target = self.resolve(relative)?;
        self.ensure_no_symlink_components(&target, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    /// 返回卷内相对路径（`/` 分隔）。
    pub fn relative_of(&self, path: &Path) -> Result<String, StorageError> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::BoundaryViolation)?;
        Ok(relative
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/"))
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::BoundaryViolation)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::BoundaryViolation);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::NotADirectory);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    pub async fn list_dir(&self, relative: &str) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.resolve_path_checked(relative, false).await?;
        self.list_resolved(&target).await
    }

    pub async fn list_resolved(&self, target: &Path) -> Result<Vec<FileEntry>, StorageError> {
        let mut dir = fs::read_dir(target).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = metadata.is_dir();
            let ext = if is_dir {
                None
            } else {
                path.extension()
                    .map(|ext| ext.to_string_lossy().to_string())
            };
            let modified = metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(format_timestamp);

            entries.push(FileEntry {
                name,
                path: self.relative_of(&path)?,
                is_dir,
                size: if is_dir { 0 } else { metadata.len() },
                ext,
                modified,
            });
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    /// 递归删除；卷根本身不可删除，目标缺失返回 NotFound。
    /// 末端为符号链接时只删除链接本身，中间路径仍不允许经过链接。
    pub async fn delete_path(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve(relative)?;
        if self.is_root(&target) {
            return Err(StorageError::RootProtected);
        }
        let parent = target.parent().ok_or(StorageError::BoundaryViolation)?;
        self.ensure_no_symlink_components(parent, false).await?;
        let metadata = fs::symlink_metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }

    /// 创建目录（含父级），已存在时视为成功。
    pub async fn create_dir(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_path_checked(relative, true).await?;
        match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_dir() => return Ok(()),
            Ok(_) => return Err(StorageError::NotADirectory),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        fs::create_dir_all(target).await?;
        Ok(())
    }
}

/// 清理不可信的相对路径：`..` 只能回退已出现的段，越过起点即越界。
fn clean_segments(untrusted: &str) -> Result<Vec<&str>, StorageError> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in untrusted.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(StorageError::BoundaryViolation);
                }
            }
            other => {
                let mut components = Path::new(other).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(_)), None) if !other.contains('\0') => {
                        segments.push(other)
                    }
                    _ => return Err(StorageError::BoundaryViolation),
                }
            }
        }
    }
    Ok(segments)
}

pub fn clean_relative(untrusted: &str) -> Result<PathBuf, StorageError> {
    Ok(clean_segments(untrusted)?.iter().collect())
}

/// 清理后的卷内相对路径（`/` 分隔，无首尾斜杠，根目录为空串）。
pub fn normalize_relative(untrusted: &str) -> Result<String, StorageError> {
    Ok(clean_segments(untrusted)?.join("/"))
}

/// 拼接两个卷内相对路径，结果仍需经过解析校验。
pub fn join_relative(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// 将不可信路径清理后拼接到 `base`，并按路径组件校验仍位于 `base` 内。
pub fn resolve_within(base: &Path, untrusted: &str) -> Result<PathBuf, StorageError> {
    let cleaned = clean_relative(untrusted)?;
    if cleaned.as_os_str().is_empty() {
        return Ok(base.to_path_buf());
    }
    let candidate = base.join(cleaned);
    if !is_within(base, &candidate) {
        return Err(StorageError::BoundaryViolation);
    }
    Ok(candidate)
}

/// 组件级包含判断：`/data2` 不在 `/data` 之内。
pub fn is_within(root: &Path, candidate: &Path) -> bool {
    match candidate.strip_prefix(root) {
        Ok(rest) => rest
            .components()
            .all(|component| matches!(component, Component::Normal(_))),
        Err(_) => false,
    }
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    BoundaryViolation,
    RootProtected,
    NotADirectory,
    InvalidArchive(String),
    Io(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::BoundaryViolation => f.write_str("path escapes the volume"),
            StorageError::RootProtected => f.write_str("the volume root cannot be deleted"),
            StorageError::NotADirectory => f.write_str("path is not a directory"),
            StorageError::InvalidArchive(msg) => write!(f, "invalid archive: {msg}"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    pub modified: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("data");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Storage::new(root))
    }

    #[test]
    fn resolve_rejects_traversal() {
        let storage = Storage::new(PathBuf::from("/data"));
        for path in [
            "/../../etc/passwd",
            "..",
            "/a/../../b",
            "..\\..\\windows",
            "./../x",
        ] {
            assert!(
                matches!(storage.resolve(path), Err(StorageError::BoundaryViolation)),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn resolve_collapses_inner_segments() {
        let storage = Storage::new(PathBuf::from("/data"));
        let resolved = storage.resolve("/world//region/./../level.dat").expect("resolve");
        assert_eq!(resolved, PathBuf::from("/data/world/level.dat"));
        assert_eq!(storage.resolve("/").expect("root"), PathBuf::from("/data"));
        assert_eq!(storage.resolve("").expect("empty"), PathBuf::from("/data"));
    }

    #[test]
    fn normalize_produces_clean_relative_paths() {
        assert_eq!(normalize_relative("//world/./region//").expect("clean"), "world/region");
        assert_eq!(normalize_relative("/").expect("root"), "");
        assert_eq!(normalize_relative("a\\b/../c").expect("mixed"), "a/c");
        assert_eq!(join_relative("", "level.dat"), "level.dat");
        assert_eq!(join_relative("world/", "level.dat"), "world/level.dat");
    }

    #[test]
    fn containment_is_component_aware() {
        let root = Path::new("/data");
        assert!(is_within(root, Path::new("/data")));
        assert!(is_within(root, Path::new("/data/world")));
        assert!(!is_within(root, Path::new("/data2")));
        assert!(!is_within(root, Path::new("/data2/world")));
        assert!(!is_within(root, Path::new("/data/../etc")));
    }

    #[test]
    fn resolve_within_validates_archive_style_names() {
        let base = Path::new("/data/subdir");
        assert_eq!(
            resolve_within(base, "world/level.dat").expect("entry"),
            PathBuf::from("/data/subdir/world/level.dat")
        );
        assert!(resolve_within(base, "../../etc/something").is_err());
        assert!(resolve_within(base, "/etc/passwd").is_ok_and(|p| p.starts_with(base)));
    }

    #[tokio::test]
    async fn delete_root_is_forbidden_in_every_spelling() {
        let (_temp, storage) = make_storage();
        for path in ["/", "//", "/.", "", "/world/..", "\\"] {
            assert!(
                matches!(
                    storage.delete_path(path).await,
                    Err(StorageError::RootProtected)
                ),
                "{path:?} should be protected"
            );
        }
        assert!(storage.root_path().exists());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let (_temp, storage) = make_storage();
        let result = storage.delete_path("/missing.txt").await;
        assert!(matches!(result, Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn delete_removes_directory_recursively() {
        let (_temp, storage) = make_storage();
        let nested = storage.root_path().join("world/region");
        std::fs::create_dir_all(&nested).expect("nested");
        std::fs::write(nested.join("r.0.0.mca"), b"chunk").expect("write");

        storage.delete_path("/world").await.expect("delete");
        assert!(!storage.root_path().join("world").exists());
    }

    #[tokio::test]
    async fn create_dir_is_idempotent() {
        let (_temp, storage) = make_storage();
        storage.create_dir("/a/b/c").await.expect("first");
        storage.create_dir("/a/b/c").await.expect("second");
        assert!(storage.root_path().join("a/b/c").is_dir());
    }

    #[tokio::test]
    async fn create_dir_over_file_is_rejected() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("server.properties"), b"x").expect("write");
        let result = storage.create_dir("/server.properties").await;
        assert!(matches!(result, Err(StorageError::NotADirectory)));
    }

    #[tokio::test]
    async fn list_dir_puts_directories_first() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path();
        std::fs::write(root.join("b.txt"), b"hello").expect("write");
        std::fs::create_dir(root.join("world")).expect("mkdir");
        std::fs::write(root.join("A.zip"), b"").expect("write");

        let entries = storage.list_dir("/").await.expect("list");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["world", "A.zip", "b.txt"]);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[0].ext, None);
        assert_eq!(entries[2].size, 5);
        assert_eq!(entries[2].ext.as_deref(), Some("txt"));
        assert_eq!(entries[2].path, "b.txt");
    }

    #[tokio::test]
    async fn list_empty_volume_is_empty() {
        let (_temp, storage) = make_storage();
        assert!(storage.list_dir("/").await.expect("list").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_path_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");

        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        let link_path = root.join("link");
        symlink(&outside, &link_path).expect("symlink");

        let storage = Storage::new(root);
        let result = storage.resolve_path_checked("link", false).await;
        assert!(matches!(result, Err(StorageError::BoundaryViolation)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_unlinks_symlink_without_following_it() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("outside dir");
        std::fs::write(outside.join("keep.txt"), b"keep").expect("write outside");
        symlink(&outside, root.join("link")).expect("symlink");

        let storage = Storage::new(root.clone());
        assert!(matches!(
            storage.delete_path("link/keep.txt").await,
            Err(StorageError::BoundaryViolation)
        ));
        storage.delete_path("link").await.expect("delete link");

        assert!(std::fs::symlink_metadata(root.join("link")).is_err());
        assert!(outside.join("keep.txt").exists());
    }
}
