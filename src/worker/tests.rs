//! Cluster Tests
//!
//! A real portal and real workers in one process, talking over localhost
//! HTTP and the portal's bus.
//!
//! ## Test Scopes
//! - **Scenarios**: zero units, a directory copy across two nodes, partial
//!   unit failure, endpoint resolution failure.
//! - **RPC**: upgrade before registration, retry exhaustion, task submission
//!   over HTTP.
//! - **Lifecycle**: worker shutdown and re-connect guard.

#[cfg(test)]
mod tests {
    use crate::config::{PortalConfig, RunnerConfig, WorkerConfig};
    use crate::endpoint::resolver::EndpointResolver;
    use crate::portal::protocol::{
        ENDPOINT_SUBMIT_TASK, JobSpec, SubmitTaskRequest, SubmitTaskResponse, TaskSpec,
    };
    use crate::portal::service::Portal;
    use crate::portal::types::WaitError;
    use crate::runner::handlers::{CopyDir, DeleteDir, TYPE_COPY_DIR, TYPE_DELETE_DIR};
    use crate::runner::registry::JobHandlerRegistry;
    use crate::runner::types::JobUnit;
    use crate::task::types::{Endpoint, Job, NodeId, ReplyStatus, Task, TaskId};
    use crate::worker::rpc::PortalClient;
    use crate::worker::worker::Worker;
    use std::sync::Arc;
    use std::time::Duration;

    async fn start_portal() -> Arc<Portal> {
        Portal::start(PortalConfig {
            host: "127.0.0.1".to_string(),
            rpc_port: 0,
            bus_port: 0,
            wait_timeout: Some(Duration::from_secs(10)),
            ..PortalConfig::default()
        })
        .await
        .unwrap()
    }

    fn worker_config(portal: &Portal, id: &str) -> WorkerConfig {
        WorkerConfig {
            node_id: Some(id.to_string()),
            advertise_addr: format!("{}.local", id),
            portal_addr: portal.rpc_addr().to_string(),
            rpc_timeout: Duration::from_millis(500),
            rpc_attempts: 2,
            runner: RunnerConfig {
                dispatch_timeout: Duration::from_secs(5),
                max_concurrent_units: 4,
            },
        }
    }

    async fn start_worker(
        portal: &Portal,
        id: &str,
        resolver: Arc<EndpointResolver>,
        handlers: Arc<JobHandlerRegistry>,
    ) -> Arc<Worker> {
        let worker = Worker::new(worker_config(portal, id), resolver, handlers);
        worker.connect().await.unwrap();
        worker
    }

    fn fs_endpoint(dir: &std::path::Path) -> Endpoint {
        Endpoint::new("fs", &[("work_dir", dir.to_str().unwrap())])
    }

    // ============================================================
    // TEST 1: Scenarios
    // ============================================================

    #[tokio::test]
    async fn test_single_node_zero_units() {
        let portal = start_portal().await;
        let worker = start_worker(
            &portal,
            "n1",
            EndpointResolver::new(),
            JobHandlerRegistry::with_builtins(),
        )
        .await;

        // Deleting an empty store produces no units
        let task = Task {
            id: TaskId("zero".into()),
            endpoints: vec![Endpoint::new("memory", &[("name", "empty")])],
            job: Job::new(
                TYPE_DELETE_DIR,
                &DeleteDir {
                    target: 0,
                    path: String::new(),
                    recursive: true,
                },
            )
            .unwrap(),
        };

        portal.publish(&task).await.unwrap();
        let report = portal.wait(&task.id).await.unwrap();

        assert_eq!(report.replies.len(), 1);
        assert_eq!(report.replies[0].node_id, NodeId("n1".into()));
        assert_eq!(report.replies[0].status, ReplyStatus::Succeeded);

        worker.shutdown().await.unwrap();
        portal.shutdown();
    }

    #[tokio::test]
    async fn test_two_nodes_copy_directory() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.path().join("b.txt"), b"beta").unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("nested/c.txt"), b"gamma").unwrap();

        let portal = start_portal().await;
        let handlers = JobHandlerRegistry::with_builtins();
        let w1 = start_worker(&portal, "n1", EndpointResolver::new(), handlers.clone()).await;
        let w2 = start_worker(&portal, "n2", EndpointResolver::new(), handlers).await;

        let task = Task {
            id: TaskId("copy".into()),
            endpoints: vec![fs_endpoint(src.path()), fs_endpoint(dst.path())],
            job: Job::new(
                TYPE_COPY_DIR,
                &CopyDir {
                    src: 0,
                    dst: 1,
                    src_path: String::new(),
                    dst_path: "out".into(),
                    recursive: true,
                },
            )
            .unwrap(),
        };

        portal.publish(&task).await.unwrap();
        let report = portal.wait(&task.id).await.unwrap();

        assert_eq!(report.replies.len(), 2);
        assert!(report.replies.iter().all(|r| r.is_success()));
        assert_eq!(std::fs::read(dst.path().join("out/a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dst.path().join("out/b.txt")).unwrap(), b"beta");
        assert_eq!(
            std::fs::read(dst.path().join("out/nested/c.txt")).unwrap(),
            b"gamma"
        );

        w1.shutdown().await.unwrap();
        w2.shutdown().await.unwrap();
        portal.shutdown();
    }

    #[tokio::test]
    async fn test_one_failing_unit_fails_the_task() {
        let handlers = JobHandlerRegistry::new();
        handlers.register_job("pair", |_job, _storages| async move {
            Ok(vec![
                JobUnit::new("maybe_fail", &false)?,
                JobUnit::new("maybe_fail", &true)?,
            ])
        });
        handlers.register_unit("maybe_fail", |unit, _storages| async move {
            let fail: bool = unit.decode()?;
            if fail {
                return Err(anyhow::anyhow!("disk on fire"));
            }
            Ok(())
        });

        let portal = start_portal().await;
        let resolver = EndpointResolver::new();
        let w1 = start_worker(&portal, "n1", resolver.clone(), handlers.clone()).await;
        let w2 = start_worker(&portal, "n2", resolver, handlers).await;

        let task = Task {
            id: TaskId("partial".into()),
            endpoints: Vec::new(),
            job: Job::new("pair", &serde_json::json!({})).unwrap(),
        };

        portal.publish(&task).await.unwrap();
        let err = portal.wait(&task.id).await.unwrap_err();

        match err {
            WaitError::Failed {
                message,
                failed,
                received,
                expected,
                ..
            } => {
                assert!(message.contains("disk on fire"), "message: {}", message);
                // Only the node that ran the bad unit fails
                assert_eq!(failed, 1);
                assert_eq!(received, 2);
                assert_eq!(expected, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        w1.shutdown().await.unwrap();
        w2.shutdown().await.unwrap();
        portal.shutdown();
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint_fails_every_node() {
        let portal = start_portal().await;
        let handlers = JobHandlerRegistry::with_builtins();
        let w1 = start_worker(&portal, "n1", EndpointResolver::new(), handlers.clone()).await;
        let w2 = start_worker(&portal, "n2", EndpointResolver::new(), handlers).await;

        let task = Task {
            id: TaskId("bad-endpoint".into()),
            endpoints: vec![Endpoint::new("s3", &[("bucket", "nope")])],
            job: Job::new(
                TYPE_DELETE_DIR,
                &DeleteDir {
                    target: 0,
                    path: String::new(),
                    recursive: false,
                },
            )
            .unwrap(),
        };

        portal.publish(&task).await.unwrap();
        let started = std::time::Instant::now();
        let err = portal.wait(&task.id).await.unwrap_err();

        // The follower does not sit out the dispatch timeout
        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            WaitError::Failed {
                failed, received, ..
            } => {
                assert_eq!(failed, 2);
                assert_eq!(received, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        w1.shutdown().await.unwrap();
        w2.shutdown().await.unwrap();
        portal.shutdown();
    }

    #[tokio::test]
    async fn test_consecutive_tasks_reuse_workers() {
        let portal = start_portal().await;
        let resolver = EndpointResolver::new();
        let handlers = JobHandlerRegistry::with_builtins();
        let w1 = start_worker(&portal, "n1", resolver.clone(), handlers.clone()).await;
        let w2 = start_worker(&portal, "n2", resolver.clone(), handlers).await;

        // Seed a shared memory store, then delete its contents twice
        let store = resolver
            .resolve(&Endpoint::new("memory", &[("name", "shared")]))
            .unwrap();
        for i in 0..6 {
            store
                .write(&format!("obj-{}", i), vec![i as u8])
                .await
                .unwrap();
        }

        for id in ["first", "second"] {
            let task = Task {
                id: TaskId(id.into()),
                endpoints: vec![Endpoint::new("memory", &[("name", "shared")])],
                job: Job::new(
                    TYPE_DELETE_DIR,
                    &DeleteDir {
                        target: 0,
                        path: String::new(),
                        recursive: true,
                    },
                )
                .unwrap(),
            };
            portal.publish(&task).await.unwrap();
            portal.wait(&task.id).await.unwrap();
        }

        assert!(store.list("", true).await.unwrap().is_empty());
        assert_eq!(portal.outstanding(), 0);
        // The dispatcher's marker precedes its reply, so both ids are free
        assert_eq!(portal.live_tasks(), 0);

        w1.shutdown().await.unwrap();
        w2.shutdown().await.unwrap();
        portal.shutdown();
    }

    // ============================================================
    // TEST 2: RPC
    // ============================================================

    #[tokio::test]
    async fn test_upgrade_before_registration_is_rejected() {
        let portal = start_portal().await;
        let client = PortalClient::new(&portal.rpc_addr().to_string(), Duration::from_millis(500), 1);

        let err = client
            .upgrade(&NodeId("n1".into()), &TaskId("t1".into()))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no nodes registered"));
        portal.shutdown();
    }

    #[tokio::test]
    async fn test_register_fails_when_portal_unreachable() {
        // Bind and release a port so nothing listens on it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = PortalClient::new(&addr, Duration::from_millis(200), 2);
        let result = client.register(&NodeId("n1".into()), "n1.local", true).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_submit_task_over_http() {
        let portal = start_portal().await;
        let resolver = EndpointResolver::new();
        let worker = start_worker(
            &portal,
            "n1",
            resolver.clone(),
            JobHandlerRegistry::with_builtins(),
        )
        .await;

        let store = resolver
            .resolve(&Endpoint::new("memory", &[("name", "http")]))
            .unwrap();
        store.write("x/1", b"one".to_vec()).await.unwrap();
        store.write("x/2", b"two".to_vec()).await.unwrap();

        let request = SubmitTaskRequest {
            task: TaskSpec {
                id: Some("via-http".into()),
                endpoints: vec![
                    Endpoint::new("memory", &[("name", "http")]),
                    Endpoint::new("memory", &[("name", "http-copy")]),
                ],
                job: JobSpec {
                    id: None,
                    kind: TYPE_COPY_DIR.into(),
                    body: serde_json::json!({
                        "src": 0,
                        "dst": 1,
                        "src_path": "x",
                        "dst_path": "y",
                        "recursive": true
                    }),
                },
            },
            timeout_ms: Some(5000),
        };

        let response = reqwest::Client::new()
            .post(format!("http://{}{}", portal.rpc_addr(), ENDPOINT_SUBMIT_TASK))
            .json(&request)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let body: SubmitTaskResponse = response.json().await.unwrap();
        assert_eq!(body.task_id, Some(TaskId("via-http".into())));
        assert_eq!(body.status, ReplyStatus::Succeeded);
        assert_eq!(body.received, 1);

        let copy = resolver
            .resolve(&Endpoint::new("memory", &[("name", "http-copy")]))
            .unwrap();
        assert_eq!(copy.read("y/1").await.unwrap(), b"one");
        assert_eq!(copy.read("y/2").await.unwrap(), b"two");

        worker.shutdown().await.unwrap();
        portal.shutdown();
    }

    // ============================================================
    // TEST 3: Lifecycle
    // ============================================================

    #[tokio::test]
    async fn test_stopped_worker_is_reported_missing() {
        let portal = start_portal().await;
        let handlers = JobHandlerRegistry::with_builtins();
        let w1 = start_worker(&portal, "n1", EndpointResolver::new(), handlers.clone()).await;
        let w2 = start_worker(&portal, "n2", EndpointResolver::new(), handlers).await;

        w2.shutdown().await.unwrap();
        assert!(!w2.is_connected());

        let task = Task {
            id: TaskId("half".into()),
            endpoints: vec![Endpoint::new("memory", &[("name", "m")])],
            job: Job::new(
                TYPE_DELETE_DIR,
                &DeleteDir {
                    target: 0,
                    path: String::new(),
                    recursive: true,
                },
            )
            .unwrap(),
        };
        portal.publish(&task).await.unwrap();
        let err = portal
            .wait_with_deadline(&task.id, Some(Duration::from_millis(1500)))
            .await
            .unwrap_err();

        match err {
            WaitError::TimedOut {
                received, missing, ..
            } => {
                assert_eq!(received, 1);
                assert_eq!(missing, vec![NodeId("n2".into())]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        w1.shutdown().await.unwrap();
        portal.shutdown();
    }

    #[tokio::test]
    async fn test_connected_worker_is_ready() {
        let portal = start_portal().await;
        let worker = start_worker(
            &portal,
            "n1",
            EndpointResolver::new(),
            JobHandlerRegistry::with_builtins(),
        )
        .await;

        // connect() returns only after the ready registration
        let nodes = portal.nodes();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].ready);
        assert_eq!(nodes[0].order, 0);

        worker.shutdown().await.unwrap();
        portal.shutdown();
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let portal = start_portal().await;
        let worker = start_worker(
            &portal,
            "n1",
            EndpointResolver::new(),
            JobHandlerRegistry::with_builtins(),
        )
        .await;

        assert!(worker.is_connected());
        assert!(worker.connect().await.is_err());
        // Registration stays single
        assert_eq!(portal.nodes().len(), 1);

        worker.shutdown().await.unwrap();
        // Shutting down again is a no-op
        worker.shutdown().await.unwrap();
        portal.shutdown();
    }
}
