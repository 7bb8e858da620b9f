use super::protocol::*;
use super::service::Portal;
use super::types::{PortalError, WaitError};
use crate::task::types::{ReplyStatus, TaskId};

use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;
use std::time::Duration;

pub async fn handle_register(
    Extension(portal): Extension<Arc<Portal>>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<RegisterReply>) {
    let reply = portal.register_with(req.node_id, req.addr, req.ready);
    (StatusCode::OK, Json(reply))
}

pub async fn handle_upgrade(
    Extension(portal): Extension<Arc<Portal>>,
    Json(req): Json<UpgradeRequest>,
) -> (StatusCode, Json<Option<UpgradeReply>>) {
    match portal.upgrade(&req.node_id, &req.task_id) {
        Ok(reply) => (StatusCode::OK, Json(Some(reply))),
        Err(PortalError::NoNodesRegistered) => {
            tracing::warn!(
                "Upgrade for task {} rejected: no nodes registered",
                req.task_id
            );
            (StatusCode::CONFLICT, Json(None))
        }
        Err(e) => {
            tracing::error!("Upgrade for task {} failed: {}", req.task_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}

pub async fn handle_submit_task(
    Extension(portal): Extension<Arc<Portal>>,
    Json(req): Json<SubmitTaskRequest>,
) -> (StatusCode, Json<SubmitTaskResponse>) {
    let task = match req.task.into_task() {
        Ok(task) => task,
        Err(e) => {
            tracing::error!("Rejected task submission: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(rejected(None, format!("invalid task: {}", e))),
            );
        }
    };

    if let Err(e) = portal.publish(&task).await {
        tracing::error!("Failed to publish task {}: {}", task.id, e);
        let status = match e {
            PortalError::InvalidTaskId(_) => StatusCode::BAD_REQUEST,
            PortalError::DuplicateTask(_) => StatusCode::CONFLICT,
            PortalError::Draining => StatusCode::SERVICE_UNAVAILABLE,
            PortalError::NoNodesRegistered | PortalError::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        return (status, Json(rejected(Some(task.id), e.to_string())));
    }

    let deadline = req
        .timeout_ms
        .map(Duration::from_millis)
        .or(portal.config().wait_timeout);

    match portal.wait_with_deadline(&task.id, deadline).await {
        Ok(report) => {
            let received = report.replies.len();
            (
                StatusCode::OK,
                Json(SubmitTaskResponse {
                    task_id: Some(report.task_id),
                    status: ReplyStatus::Succeeded,
                    message: String::new(),
                    received,
                    expected: received,
                }),
            )
        }
        Err(WaitError::Failed {
            task_id,
            message,
            received,
            expected,
            ..
        }) => (
            StatusCode::OK,
            Json(SubmitTaskResponse {
                task_id: Some(task_id),
                status: ReplyStatus::Failed,
                message,
                received,
                expected,
            }),
        ),
        Err(WaitError::TimedOut {
            task_id,
            received,
            expected,
            missing,
            ..
        }) => {
            let missing: Vec<String> = missing.into_iter().map(|id| id.0).collect();
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(SubmitTaskResponse {
                    task_id: Some(task_id),
                    status: ReplyStatus::Failed,
                    message: format!("timed out waiting for {}", missing.join(", ")),
                    received,
                    expected,
                }),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(rejected(Some(task.id), e.to_string())),
        ),
    }
}

pub async fn handle_nodes(
    Extension(portal): Extension<Arc<Portal>>,
) -> (StatusCode, Json<NodesResponse>) {
    (
        StatusCode::OK,
        Json(NodesResponse {
            nodes: portal.nodes(),
        }),
    )
}

fn rejected(task_id: Option<TaskId>, message: String) -> SubmitTaskResponse {
    SubmitTaskResponse {
        task_id,
        status: ReplyStatus::Failed,
        message,
        received: 0,
        expected: 0,
    }
}
