//! Built-in Storage Operations
//!
//! Directory-level jobs (`copy_dir`, `move_dir`, `delete_dir`) decompose into
//! one file-level unit per listed object. File-level types double as jobs of
//! their own and run as a single unit.
//!
//! Endpoints are referenced by index into the task's endpoint list.

use super::registry::{JobHandlerRegistry, Storages};
use super::types::JobUnit;
use crate::endpoint::storage::{Storage, join_path};
use crate::task::types::Job;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TYPE_COPY_DIR: &str = "copy_dir";
pub const TYPE_COPY_FILE: &str = "copy_file";
pub const TYPE_MOVE_DIR: &str = "move_dir";
pub const TYPE_MOVE_FILE: &str = "move_file";
pub const TYPE_DELETE_DIR: &str = "delete_dir";
pub const TYPE_DELETE_FILE: &str = "delete_file";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyDir {
    pub src: usize,
    pub dst: usize,
    pub src_path: String,
    pub dst_path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyFile {
    pub src: usize,
    pub dst: usize,
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteDir {
    pub target: usize,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteFile {
    pub target: usize,
    pub path: String,
}

pub fn register_builtins(registry: &JobHandlerRegistry) {
    registry.register_job(TYPE_COPY_DIR, |job, storages| async move {
        split_transfer(&job, &storages, TYPE_COPY_FILE).await
    });
    registry.register_job(TYPE_MOVE_DIR, |job, storages| async move {
        split_transfer(&job, &storages, TYPE_MOVE_FILE).await
    });
    registry.register_job(TYPE_DELETE_DIR, |job, storages| async move {
        split_delete(&job, &storages).await
    });

    registry.register_unit(TYPE_COPY_FILE, |unit, storages| async move {
        let body: CopyFile = unit.decode()?;
        copy_object(&storages, &body).await
    });
    registry.register_unit(TYPE_MOVE_FILE, |unit, storages| async move {
        let body: CopyFile = unit.decode()?;
        copy_object(&storages, &body).await?;
        endpoint(&storages, body.src)?.delete(&body.src_path).await
    });
    registry.register_unit(TYPE_DELETE_FILE, |unit, storages| async move {
        let body: DeleteFile = unit.decode()?;
        endpoint(&storages, body.target)?.delete(&body.path).await
    });
}

/// Looks up a resolved endpoint by its index in the task.
pub fn endpoint(storages: &Storages, idx: usize) -> Result<&Arc<dyn Storage>> {
    storages.get(idx).ok_or_else(|| {
        anyhow::anyhow!(
            "Endpoint index {} out of range ({} resolved)",
            idx,
            storages.len()
        )
    })
}

async fn split_transfer(job: &Job, storages: &Storages, unit_kind: &str) -> Result<Vec<JobUnit>> {
    let body: CopyDir = job.decode()?;
    // Validate the destination before fanning out.
    endpoint(storages, body.dst)?;

    let objects = endpoint(storages, body.src)?
        .list(&body.src_path, body.recursive)
        .await?;

    objects
        .iter()
        .map(|object| {
            JobUnit::new(
                unit_kind,
                &CopyFile {
                    src: body.src,
                    dst: body.dst,
                    src_path: join_path(&body.src_path, &object.path),
                    dst_path: join_path(&body.dst_path, &object.path),
                },
            )
        })
        .collect()
}

async fn split_delete(job: &Job, storages: &Storages) -> Result<Vec<JobUnit>> {
    let body: DeleteDir = job.decode()?;

    let objects = endpoint(storages, body.target)?
        .list(&body.path, body.recursive)
        .await?;

    objects
        .iter()
        .map(|object| {
            JobUnit::new(
                TYPE_DELETE_FILE,
                &DeleteFile {
                    target: body.target,
                    path: join_path(&body.path, &object.path),
                },
            )
        })
        .collect()
}

async fn copy_object(storages: &Storages, body: &CopyFile) -> Result<()> {
    let data = endpoint(storages, body.src)?.read(&body.src_path).await?;
    let size = data.len();
    endpoint(storages, body.dst)?
        .write(&body.dst_path, data)
        .await?;

    tracing::debug!(
        "Copied {} -> {} ({} bytes)",
        body.src_path,
        body.dst_path,
        size
    );
    Ok(())
}
