use anyhow::Result;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by `Storage` operations, so handles can live behind `dyn`.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One object found by `Storage::list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Path relative to the listed directory, `/`-separated.
    pub path: String,
    pub size: u64,
}

/// A live handle to one storage location.
///
/// Paths are `/`-separated and relative to the handle's root.
pub trait Storage: Send + Sync {
    /// The endpoint type this handle was resolved from.
    fn kind(&self) -> &str;

    fn list<'a>(&'a self, path: &'a str, recursive: bool) -> StorageFuture<'a, Vec<ObjectEntry>>;

    fn read<'a>(&'a self, path: &'a str) -> StorageFuture<'a, Vec<u8>>;

    fn write<'a>(&'a self, path: &'a str, data: Vec<u8>) -> StorageFuture<'a, ()>;

    fn delete<'a>(&'a self, path: &'a str) -> StorageFuture<'a, ()>;
}

/// Normalizes a relative object path: drops empty and `.` segments and rejects `..`.
pub fn clean_path(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(anyhow::anyhow!("Path escapes storage root: {}", path)),
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// Joins a directory and a relative path with exactly one separator.
pub fn join_path(dir: &str, rel: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let rel = rel.trim_start_matches('/');
    if dir.is_empty() {
        rel.to_string()
    } else if rel.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir, rel)
    }
}
