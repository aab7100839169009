use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Error that occurs when reading a local file fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to read file `{path}`: {source}")]
pub struct FileReadError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Reads the whole file at the given path into a string.
///
/// # Errors
///
/// Returns a [`FileReadError`] if the file cannot be opened or is not valid UTF-8.
///
/// # Example
/// ```no_run
/// # use stats_collect::fsutil;
/// # async fn example() -> Result<(), fsutil::FileReadError> {
/// let contents = fsutil::read_to_string("/some/file.txt").await?;
/// # Ok(())
/// # }
/// ```
pub async fn read_to_string(path: impl AsRef<Path>) -> Result<String, FileReadError> {
    let path = path.as_ref();
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| FileReadError {
            path: path.to_path_buf(),
            source,
        })
}

/// Returns `true` if `path` exists and is a Unix domain socket.
pub fn is_socket(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

/// Returns `true` if `path` is a regular file with at least one execute bit set.
pub fn is_executable(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Looks up an executable called `name` in `dirs`, in order.
pub fn search_executable<'a>(
    name: &str,
    dirs: impl IntoIterator<Item = &'a Path>,
) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}
