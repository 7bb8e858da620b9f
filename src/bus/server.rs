//! Message Broker
//!
//! A small subject-based broker hosted by the portal. Every client connection
//! gets a reader task (routes incoming frames) and a writer task (drains an
//! outbound channel onto the socket), so a slow subscriber never blocks
//! routing for the others.

use super::types::{Frame, Message, read_frame, write_frame};

use anyhow::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type ConnId = u64;

#[derive(Debug, Clone)]
struct SubEntry {
    conn: ConnId,
    sid: u64,
    queue: Option<String>,
}

/// Subject -> subscriptions, plus round-robin cursors per queue group.
#[derive(Default)]
struct SubscriptionTable {
    subjects: HashMap<String, Vec<SubEntry>>,
    cursors: HashMap<(String, String), usize>,
}

impl SubscriptionTable {
    fn insert(&mut self, subject: String, entry: SubEntry) {
        self.subjects.entry(subject).or_default().push(entry);
    }

    fn remove(&mut self, conn: ConnId, sid: u64) {
        self.subjects.retain(|_, entries| {
            entries.retain(|e| !(e.conn == conn && e.sid == sid));
            !entries.is_empty()
        });
    }

    fn remove_connection(&mut self, conn: ConnId) {
        self.subjects.retain(|_, entries| {
            entries.retain(|e| e.conn != conn);
            !entries.is_empty()
        });
    }

    /// Picks the recipients of one message: every plain subscriber, and one
    /// member of each queue group in rotation.
    fn targets(&mut self, subject: &str) -> Vec<Vec<SubEntry>> {
        let Some(entries) = self.subjects.get(subject) else {
            return Vec::new();
        };

        let mut plain = Vec::new();
        let mut groups: HashMap<String, Vec<SubEntry>> = HashMap::new();
        for entry in entries {
            match &entry.queue {
                None => plain.push(vec![entry.clone()]),
                Some(group) => groups.entry(group.clone()).or_default().push(entry.clone()),
            }
        }

        let mut targets = plain;
        for (group, members) in groups {
            let cursor = self
                .cursors
                .entry((subject.to_string(), group))
                .or_insert(0);
            let start = *cursor % members.len();
            *cursor = cursor.wrapping_add(1);

            // Candidates in rotation order, so delivery can fall through to the
            // next member if the chosen connection has gone away.
            let rotated = members
                .iter()
                .cycle()
                .skip(start)
                .take(members.len())
                .cloned()
                .collect();
            targets.push(rotated);
        }
        targets
    }
}

struct BrokerState {
    next_conn: AtomicU64,
    connections: DashMap<ConnId, mpsc::UnboundedSender<Frame>>,
    subscriptions: Mutex<SubscriptionTable>,
    retained: DashMap<String, Message>,
}

impl BrokerState {
    fn table(&self) -> std::sync::MutexGuard<'_, SubscriptionTable> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send(&self, conn: ConnId, frame: Frame) -> bool {
        match self.connections.get(&conn) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn route(&self, message: Message) {
        let targets = self.table().targets(&message.subject);

        for candidates in targets {
            let delivered = candidates.iter().any(|entry| {
                self.send(
                    entry.conn,
                    Frame::Deliver {
                        sid: entry.sid,
                        message: message.clone(),
                    },
                )
            });
            if !delivered {
                tracing::debug!("Dropped message on {}: no live subscriber", message.subject);
            }
        }
    }

    fn handle_frame(&self, conn: ConnId, frame: Frame) {
        match frame {
            Frame::Subscribe {
                sid,
                subject,
                queue,
            } => {
                tracing::debug!(
                    "Connection {} subscribed to {} (queue: {:?})",
                    conn,
                    subject,
                    queue
                );
                let plain = queue.is_none();
                self.table().insert(
                    subject.clone(),
                    SubEntry { conn, sid, queue },
                );

                if plain && let Some(retained) = self.retained.get(&subject) {
                    self.send(
                        conn,
                        Frame::Deliver {
                            sid,
                            message: retained.value().clone(),
                        },
                    );
                }
            }

            Frame::Unsubscribe { sid } => {
                self.table().remove(conn, sid);
            }

            Frame::Publish {
                subject,
                reply_to,
                payload,
                retain,
            } => {
                if retain {
                    if payload.is_empty() {
                        self.retained.remove(&subject);
                        return;
                    }
                    self.retained.insert(
                        subject.clone(),
                        Message {
                            subject: subject.clone(),
                            reply_to: reply_to.clone(),
                            payload: payload.clone(),
                        },
                    );
                }

                self.route(Message {
                    subject,
                    reply_to,
                    payload,
                });
            }

            Frame::Ping { id } => {
                self.send(conn, Frame::Pong { id });
            }

            Frame::Pong { .. } | Frame::Deliver { .. } => {
                tracing::warn!("Connection {} sent a server-only frame", conn);
            }
        }
    }

    fn disconnect(&self, conn: ConnId) {
        self.table().remove_connection(conn);
        self.connections.remove(&conn);
        tracing::debug!("Connection {} closed", conn);
    }
}

/// The broker process: an accept loop plus shared routing state.
pub struct BusServer {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    accept_handle: JoinHandle<()>,
}

impl BusServer {
    /// Binds the listener and starts accepting connections in the background.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(BrokerState {
            next_conn: AtomicU64::new(1),
            connections: DashMap::new(),
            subscriptions: Mutex::new(SubscriptionTable::default()),
            retained: DashMap::new(),
        });

        let accept_state = state.clone();
        let accept_handle = tokio::spawn(async move {
            accept_loop(listener, accept_state).await;
        });

        tracing::info!("Message bus listening on {}", addr);

        Ok(Self {
            addr,
            state,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    pub fn retained_count(&self) -> usize {
        self.state.retained.len()
    }

    /// Stops accepting connections and drops every open one.
    pub fn shutdown(&self) {
        self.accept_handle.abort();
        self.state.connections.clear();
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<BrokerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn = state.next_conn.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("Accepted bus connection {} from {}", conn, peer);
                let state = state.clone();
                tokio::spawn(async move {
                    serve_connection(conn, stream, state).await;
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept bus connection: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(conn: ConnId, stream: TcpStream, state: Arc<BrokerState>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    state.connections.insert(conn, tx);

    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("Bus connection {} write failed: {}", conn, e);
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => state.handle_frame(conn, frame),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Bus connection {} read failed: {}", conn, e);
                break;
            }
        }
    }

    // Removing the sender ends the writer once it has flushed what is queued.
    state.disconnect(conn);
    let _ = writer_handle.await;
}
