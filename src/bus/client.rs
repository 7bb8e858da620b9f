//! Bus Client
//!
//! `BusConnection` is one TCP session with the broker. Outbound frames go
//! through a channel to a writer task (publish never blocks); a reader task
//! fans deliveries out to per-subscription channels.

use super::types::{Frame, Message, encode, read_frame, write_frame};

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long a flush waits for the broker's pong.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

enum Outbound {
    Frame(Frame),
    Close,
}

type SubscriberMap = Arc<DashMap<u64, mpsc::UnboundedSender<Message>>>;

pub struct BusConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    subscribers: SubscriberMap,
    pongs: Arc<DashMap<u64, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reader_handle: JoinHandle<()>,
    writer_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BusConnection {
    /// Opens a session with the broker at `addr`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| anyhow::anyhow!("bus connect {}: {}", addr, e))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let subscribers: SubscriberMap = Arc::new(DashMap::new());
        let pongs: Arc<DashMap<u64, oneshot::Sender<()>>> = Arc::new(DashMap::new());

        let writer_handle = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(frame) => {
                        if let Err(e) = write_frame(&mut writer, &frame).await {
                            tracing::debug!("Bus write failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            // Dropping the write half signals end of stream to the broker.
        });

        let reader_subscribers = subscribers.clone();
        let reader_pongs = pongs.clone();
        let reader_handle = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(Frame::Deliver { sid, message })) => {
                        if let Some(tx) = reader_subscribers.get(&sid) {
                            let _ = tx.send(message);
                        }
                    }
                    Ok(Some(Frame::Pong { id })) => {
                        if let Some((_, tx)) = reader_pongs.remove(&id) {
                            let _ = tx.send(());
                        }
                    }
                    Ok(Some(other)) => {
                        tracing::warn!("Unexpected frame from broker: {:?}", other);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("Bus read failed: {}", e);
                        break;
                    }
                }
            }
            // Ends every subscription stream and fails pending flushes.
            reader_subscribers.clear();
            reader_pongs.clear();
        });

        Ok(Self {
            outbound,
            subscribers,
            pongs,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader_handle,
            writer_handle: std::sync::Mutex::new(Some(writer_handle)),
        })
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("bus connection is closed"));
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| anyhow::anyhow!("bus connection is closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.reader_handle.is_finished()
    }

    /// Publishes raw bytes. Fire-and-forget.
    pub fn publish(&self, subject: &str, reply_to: Option<&str>, payload: Vec<u8>) -> Result<()> {
        self.send(Frame::Publish {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
            retain: false,
        })
    }

    /// Publishes a bincode-encoded value.
    pub fn publish_msg<T: Serialize>(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        value: &T,
    ) -> Result<()> {
        self.publish(subject, reply_to, encode(value)?)
    }

    /// Publishes a value the broker keeps for subscribers that arrive later.
    pub fn publish_retained<T: Serialize>(&self, subject: &str, value: &T) -> Result<()> {
        self.send(Frame::Publish {
            subject: subject.to_string(),
            reply_to: None,
            payload: encode(value)?,
            retain: true,
        })
    }

    /// Removes the retained value of `subject`.
    pub fn clear_retained(&self, subject: &str) -> Result<()> {
        self.send(Frame::Publish {
            subject: subject.to_string(),
            reply_to: None,
            payload: Vec::new(),
            retain: true,
        })
    }

    /// Broadcast subscription: receives every message on `subject`.
    pub fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, None)
    }

    /// Competing-consumer subscription: each message on `subject` goes to
    /// exactly one member of `group`.
    pub fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, Some(group.to_string()))
    }

    fn subscribe_inner(&self, subject: &str, queue: Option<String>) -> Result<Subscription> {
        let sid = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(sid, tx);

        if let Err(e) = self.send(Frame::Subscribe {
            sid,
            subject: subject.to_string(),
            queue,
        }) {
            self.subscribers.remove(&sid);
            return Err(e);
        }

        Ok(Subscription {
            sid,
            subject: subject.to_string(),
            rx,
            outbound: self.outbound.clone(),
            subscribers: self.subscribers.clone(),
        })
    }

    /// Waits until the broker has routed every frame sent before this call.
    pub async fn flush(&self) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pongs.insert(id, tx);

        if let Err(e) = self
            .outbound
            .send(Outbound::Frame(Frame::Ping { id }))
            .map_err(|_| anyhow::anyhow!("bus connection is closed"))
        {
            self.pongs.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(FLUSH_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(anyhow::anyhow!("bus connection closed during flush")),
            Err(_) => {
                self.pongs.remove(&id);
                Err(anyhow::anyhow!("bus flush timed out after {:?}", FLUSH_TIMEOUT))
            }
        }
    }

    /// Unsubscribes everything, flushes outstanding publishes and closes the
    /// session. Further publishes fail.
    pub async fn drain(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let sids: Vec<u64> = self.subscribers.iter().map(|e| *e.key()).collect();
        for sid in sids {
            self.subscribers.remove(&sid);
            let _ = self.outbound.send(Outbound::Frame(Frame::Unsubscribe { sid }));
        }

        let flushed = self.flush().await;

        let _ = self.outbound.send(Outbound::Close);
        let handle = self
            .writer_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        flushed
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
        self.reader_handle.abort();
    }
}

/// A stream of messages for one subscription. Dropping it unsubscribes.
pub struct Subscription {
    sid: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::UnboundedSender<Outbound>,
    subscribers: SubscriberMap,
}

impl Subscription {
    /// Next message, or `None` once the subscription or connection has ended.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// A message that has already been delivered, without waiting.
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.subscribers.remove(&self.sid).is_some() {
            let _ = self
                .outbound
                .send(Outbound::Frame(Frame::Unsubscribe { sid: self.sid }));
        }
    }
}
