use super::storage::{ObjectEntry, Storage, StorageFuture, clean_path, join_path};

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Local filesystem storage rooted at `work_dir`.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: work_dir.into(),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let cleaned = clean_path(path)?;
        if cleaned.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(cleaned))
        }
    }

    async fn list_dir(&self, path: &str, recursive: bool) -> Result<Vec<ObjectEntry>> {
        let base = self.resolve(path)?;
        let mut entries = Vec::new();
        // (absolute dir, path of that dir relative to `base`)
        let mut pending = vec![(base.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut reader = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("list {}", dir.display()))?;

            while let Some(entry) = reader.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let rel = join_path(&prefix, &name);
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    if recursive {
                        pending.push((entry.path(), rel));
                    }
                } else if file_type.is_file() {
                    let size = entry.metadata().await?.len();
                    entries.push(ObjectEntry { path: rel, size });
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

impl Storage for FsStorage {
    fn kind(&self) -> &str {
        "fs"
    }

    fn list<'a>(&'a self, path: &'a str, recursive: bool) -> StorageFuture<'a, Vec<ObjectEntry>> {
        Box::pin(self.list_dir(path, recursive))
    }

    fn read<'a>(&'a self, path: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            tokio::fs::read(&full)
                .await
                .with_context(|| format!("read {}", full.display()))
        })
    }

    fn write<'a>(&'a self, path: &'a str, data: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, data)
                .await
                .with_context(|| format!("write {}", full.display()))
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            tokio::fs::remove_file(&full)
                .await
                .with_context(|| format!("delete {}", full.display()))
        })
    }
}
