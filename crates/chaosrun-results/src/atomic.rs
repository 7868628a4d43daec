use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Sibling path a file is staged under before being renamed into place.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Writes `contents` to `path` through a staged sibling file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let partial = partial_path(path);
    if let Err(e) = std::fs::write(&partial, contents) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }
    std::fs::rename(&partial, path)
}

/// Async flavour of [`write_atomic`].
pub(crate) async fn write_atomic_async(path: &Path, contents: &[u8]) -> io::Result<()> {
    let partial = partial_path(path);
    if let Err(e) = tokio::fs::write(&partial, contents).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, path).await
}
