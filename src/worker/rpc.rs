//! Portal RPC Client
//!
//! JSON-over-HTTP calls from a worker to the portal. Every call carries a
//! per-attempt timeout and is retried with jittered exponential backoff.

use crate::portal::protocol::{
    ENDPOINT_REGISTER, ENDPOINT_UPGRADE, RegisterReply, RegisterRequest, UpgradeReply,
    UpgradeRequest,
};
use crate::task::types::{NodeId, TaskId};

use anyhow::{Context, Result};
use std::time::Duration;

pub struct PortalClient {
    http_client: reqwest::Client,
    portal_addr: String,
    timeout: Duration,
    attempts: usize,
}

impl PortalClient {
    pub fn new(portal_addr: &str, timeout: Duration, attempts: usize) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            portal_addr: portal_addr.to_string(),
            timeout,
            attempts: attempts.max(1),
        }
    }

    pub fn portal_addr(&self) -> &str {
        &self.portal_addr
    }

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    tracing::debug!(
                        "POST {} failed (attempt {}/{}): {}",
                        url,
                        attempt + 1,
                        self.attempts,
                        e
                    );
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    /// Announces this node. Safe to repeat: the portal keeps the first entry
    /// and only ever moves it from not ready to ready.
    pub async fn register(&self, node_id: &NodeId, addr: &str, ready: bool) -> Result<RegisterReply> {
        let response = self
            .post_with_retry(
                format!("http://{}{}", self.portal_addr, ENDPOINT_REGISTER),
                &RegisterRequest {
                    node_id: node_id.clone(),
                    addr: addr.to_string(),
                    ready,
                },
            )
            .await
            .with_context(|| format!("register with portal {}", self.portal_addr))?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Register failed {}", response.status()));
        }

        Ok(response.json::<RegisterReply>().await?)
    }

    /// Asks the portal which node dispatches `task_id`.
    pub async fn upgrade(&self, node_id: &NodeId, task_id: &TaskId) -> Result<UpgradeReply> {
        let response = self
            .post_with_retry(
                format!("http://{}{}", self.portal_addr, ENDPOINT_UPGRADE),
                &UpgradeRequest {
                    node_id: node_id.clone(),
                    task_id: task_id.clone(),
                },
            )
            .await
            .with_context(|| format!("upgrade task {}", task_id))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(anyhow::anyhow!(
                "Upgrade for task {} rejected: no nodes registered",
                task_id
            ));
        }
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Upgrade failed {}", response.status()));
        }

        response
            .json::<Option<UpgradeReply>>()
            .await?
            .ok_or_else(|| anyhow::anyhow!("Upgrade for task {} returned no dispatcher", task_id))
    }
}
