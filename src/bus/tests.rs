//! Message Bus Tests
//!
//! Runs a real broker on an ephemeral localhost port and drives it through
//! several client connections.
//!
//! ## Test Scopes
//! - **Codec**: frame round trip through an in-memory duplex pipe.
//! - **Routing**: broadcast fan-out, queue-group exclusivity, reply subjects.
//! - **Lifecycle**: retained messages, unsubscribe, drain.

#[cfg(test)]
mod tests {
    use crate::bus::client::BusConnection;
    use crate::bus::server::BusServer;
    use crate::bus::types::{Frame, read_frame, write_frame};
    use std::time::Duration;

    async fn start_broker() -> (BusServer, String) {
        let server = BusServer::bind("127.0.0.1:0").await.expect("bind broker");
        let addr = server.local_addr().to_string();
        (server, addr)
    }

    async fn recv_u32(sub: &mut crate::bus::client::Subscription) -> Option<u32> {
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .ok()??;
        msg.decode().ok()
    }

    // ============================================================
    // CODEC
    // ============================================================

    #[tokio::test]
    async fn test_frame_codec_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(
            &mut a,
            &Frame::Subscribe {
                sid: 7,
                subject: "tasks".into(),
                queue: Some("g".into()),
            },
        )
        .await
        .unwrap();
        drop(a);

        match read_frame(&mut b).await.unwrap() {
            Some(Frame::Subscribe {
                sid,
                subject,
                queue,
            }) => {
                assert_eq!(sid, 7);
                assert_eq!(subject, "tasks");
                assert_eq!(queue.as_deref(), Some("g"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Clean end of stream
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    // ============================================================
    // ROUTING
    // ============================================================

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let (_server, addr) = start_broker().await;
        let c1 = BusConnection::connect(&addr).await.unwrap();
        let c2 = BusConnection::connect(&addr).await.unwrap();
        let publisher = BusConnection::connect(&addr).await.unwrap();

        let mut s1 = c1.subscribe("tasks").unwrap();
        let mut s2 = c2.subscribe("tasks").unwrap();
        c1.flush().await.unwrap();
        c2.flush().await.unwrap();

        publisher.publish_msg("tasks", None, &42u32).unwrap();

        assert_eq!(recv_u32(&mut s1).await, Some(42));
        assert_eq!(recv_u32(&mut s2).await, Some(42));
    }

    #[tokio::test]
    async fn test_queue_group_delivers_each_message_once() {
        let (_server, addr) = start_broker().await;
        let publisher = BusConnection::connect(&addr).await.unwrap();

        let mut conns = Vec::new();
        let mut subs = Vec::new();
        for _ in 0..3 {
            let conn = BusConnection::connect(&addr).await.unwrap();
            subs.push(conn.queue_subscribe("task.x", "task.x").unwrap());
            conn.flush().await.unwrap();
            conns.push(conn);
        }

        const UNITS: u32 = 30;
        for i in 0..UNITS {
            publisher.publish_msg("task.x", None, &i).unwrap();
        }
        publisher.flush().await.unwrap();

        let mut seen = Vec::new();
        let mut per_consumer = Vec::new();
        for sub in subs.iter_mut() {
            let mut count = 0;
            while let Ok(Some(msg)) =
                tokio::time::timeout(Duration::from_millis(300), sub.next()).await
            {
                seen.push(msg.decode::<u32>().unwrap());
                count += 1;
            }
            per_consumer.push(count);
        }

        seen.sort();
        assert_eq!(seen, (0..UNITS).collect::<Vec<_>>(), "every unit exactly once");
        // Rotation spreads units evenly between members.
        assert_eq!(per_consumer, vec![10, 10, 10]);
    }

    #[tokio::test]
    async fn test_queue_group_and_broadcast_coexist() {
        let (_server, addr) = start_broker().await;
        let conn = BusConnection::connect(&addr).await.unwrap();

        let mut worker_a = conn.queue_subscribe("jobs", "workers").unwrap();
        let mut worker_b = conn.queue_subscribe("jobs", "workers").unwrap();
        let mut observer = conn.subscribe("jobs").unwrap();

        conn.publish_msg("jobs", None, &1u32).unwrap();

        assert_eq!(recv_u32(&mut observer).await, Some(1));
        let a = tokio::time::timeout(Duration::from_millis(300), worker_a.next()).await;
        let b = tokio::time::timeout(Duration::from_millis(300), worker_b.next()).await;
        let delivered = [a, b]
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_reply_subject_is_carried() {
        let (_server, addr) = start_broker().await;
        let conn = BusConnection::connect(&addr).await.unwrap();

        let mut sub = conn.subscribe("tasks").unwrap();
        conn.publish_msg("tasks", Some("task-1"), &5u32).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subject, "tasks");
        assert_eq!(msg.reply_to.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn test_message_without_subscribers_is_dropped() {
        let (_server, addr) = start_broker().await;
        let conn = BusConnection::connect(&addr).await.unwrap();

        conn.publish_msg("nobody", None, &1u32).unwrap();
        conn.flush().await.unwrap();

        let mut late = conn.subscribe("nobody").unwrap();
        let got = tokio::time::timeout(Duration::from_millis(200), late.next()).await;
        assert!(got.is_err(), "non-retained messages are not replayed");
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    #[tokio::test]
    async fn test_retained_message_reaches_late_subscriber() {
        let (server, addr) = start_broker().await;
        let conn = BusConnection::connect(&addr).await.unwrap();

        conn.publish_retained("task.1.done", &3u32).unwrap();
        conn.flush().await.unwrap();
        assert_eq!(server.retained_count(), 1);

        let mut late = conn.subscribe("task.1.done").unwrap();
        assert_eq!(recv_u32(&mut late).await, Some(3));

        conn.clear_retained("task.1.done").unwrap();
        conn.flush().await.unwrap();
        assert_eq!(server.retained_count(), 0);

        // Clearing is not delivered as a message.
        let got = tokio::time::timeout(Duration::from_millis(200), late.next()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let (_server, addr) = start_broker().await;
        let conn = BusConnection::connect(&addr).await.unwrap();

        let first = conn.queue_subscribe("jobs", "g").unwrap();
        let mut second = conn.queue_subscribe("jobs", "g").unwrap();
        drop(first);

        for i in 0..4u32 {
            conn.publish_msg("jobs", None, &i).unwrap();
        }

        for i in 0..4u32 {
            assert_eq!(recv_u32(&mut second).await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_drain_closes_connection() {
        let (server, addr) = start_broker().await;
        let conn = BusConnection::connect(&addr).await.unwrap();
        let mut sub = conn.subscribe("tasks").unwrap();
        conn.flush().await.unwrap();
        assert_eq!(server.connection_count(), 1);

        conn.drain().await.unwrap();

        assert!(conn.is_closed());
        assert!(conn.publish_msg("tasks", None, &1u32).is_err());
        assert!(sub.next().await.is_none(), "subscription ends after drain");

        // Draining twice is a no-op.
        conn.drain().await.unwrap();
    }
}
