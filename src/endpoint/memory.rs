use super::storage::{ObjectEntry, Storage, StorageFuture, clean_path};

use anyhow::Result;
use dashmap::DashMap;

/// In-memory object store. Keys are cleaned `/`-separated paths.
#[derive(Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn list_prefix(&self, path: &str, recursive: bool) -> Result<Vec<ObjectEntry>> {
        let dir = clean_path(path)?;
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let mut entries: Vec<ObjectEntry> = self
            .objects
            .iter()
            .filter_map(|entry| {
                let rel = entry.key().strip_prefix(&prefix)?;
                if !recursive && rel.contains('/') {
                    return None;
                }
                Some(ObjectEntry {
                    path: rel.to_string(),
                    size: entry.value().len() as u64,
                })
            })
            .collect();

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

impl Storage for MemoryStorage {
    fn kind(&self) -> &str {
        "memory"
    }

    fn list<'a>(&'a self, path: &'a str, recursive: bool) -> StorageFuture<'a, Vec<ObjectEntry>> {
        Box::pin(async move { self.list_prefix(path, recursive) })
    }

    fn read<'a>(&'a self, path: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let key = clean_path(path)?;
            self.objects
                .get(&key)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| anyhow::anyhow!("Object not found: {}", key))
        })
    }

    fn write<'a>(&'a self, path: &'a str, data: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let key = clean_path(path)?;
            if key.is_empty() {
                return Err(anyhow::anyhow!("Cannot write to the storage root"));
            }
            self.objects.insert(key, data);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, path: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let key = clean_path(path)?;
            self.objects
                .remove(&key)
                .map(|_| ())
                .ok_or_else(|| anyhow::anyhow!("Object not found: {}", key))
        })
    }
}
