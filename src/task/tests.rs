#[cfg(test)]
mod tests {
    use crate::task::types::{
        Endpoint, Job, NodeId, ReplyStatus, TASKS_SUBJECT, Task, TaskId, TaskReply,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Body {
        path: String,
    }

    #[test]
    fn test_task_subjects_are_derived_from_id() {
        let id = TaskId("abc".to_string());

        assert_eq!(id.topic(), "task.abc");
        assert_eq!(id.reply_subject(), "abc");
        assert_eq!(id.ack_subject(), "task.abc.ack");
        assert_eq!(id.done_subject(), "task.abc.done");
    }

    #[test]
    fn test_task_id_must_not_collide_with_protocol_subjects() {
        for reserved in [TASKS_SUBJECT, "task", "task.x", "task.x.ack", "task.x.done", ""] {
            assert!(
                TaskId(reserved.to_string()).validate().is_err(),
                "{:?} accepted",
                reserved
            );
        }
        assert!(TaskId("copy job".into()).validate().is_err());

        // Plain ids, including dotted ones, are fine
        for id in ["abc", "nightly.backup", "tasks-2", "my.task.x"] {
            assert!(TaskId(id.to_string()).validate().is_ok(), "{:?} rejected", id);
        }
        assert!(TaskId::new().validate().is_ok());
    }

    #[test]
    fn test_node_id_is_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
    }

    #[test]
    fn test_endpoint_lookup_returns_first_value() {
        let ep = Endpoint::new("fs", &[("work_dir", "/tmp/a"), ("work_dir", "/tmp/b")]);

        assert_eq!(ep.get("work_dir"), Some("/tmp/a"));
        assert_eq!(ep.get("missing"), None);
    }

    #[test]
    fn test_job_body_decodes() {
        let job = Job::new("copy_dir", &Body { path: "a/b".into() }).unwrap();

        let body: Body = job.decode().unwrap();
        assert_eq!(body.path, "a/b");
        assert!(job.decode::<Vec<u32>>().is_err());
    }

    #[test]
    fn test_task_survives_bincode() {
        // The bus encodes tasks with bincode, which rejects self-describing types.
        let task = Task {
            id: TaskId::new(),
            endpoints: vec![Endpoint::new("memory", &[("name", "src")])],
            job: Job::new("copy_dir", &Body { path: "x".into() }).unwrap(),
        };

        let bytes = bincode::serialize(&task).unwrap();
        let restored: Task = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, task);
    }

    #[test]
    fn test_endpoint_json_uses_type_key() {
        let json = r#"{"type":"fs","pairs":[{"key":"work_dir","value":"/data"}]}"#;
        let ep: Endpoint = serde_json::from_str(json).unwrap();

        assert_eq!(ep.kind, "fs");
        assert_eq!(ep.get("work_dir"), Some("/data"));
    }

    #[test]
    fn test_reply_success_flag() {
        let reply = TaskReply {
            id: TaskId::new(),
            node_id: NodeId::new(),
            status: ReplyStatus::Failed,
            message: "boom".into(),
        };
        assert!(!reply.is_success());
    }
}
