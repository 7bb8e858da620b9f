use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A message as seen by a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    /// Subject the receiver should answer on, if any.
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode(&self.payload)
    }
}

/// The wire protocol between a `BusConnection` and the `BusServer`.
///
/// - `Subscribe/Unsubscribe`: manage interest; `queue` makes the subscription a
///   member of a competing-consumer group.
/// - `Publish`: route a message. `retain` keeps it as the subject's last value;
///   a retained publish with an empty payload clears it.
/// - `Ping/Pong`: flush barrier, the broker answers after routing every frame
///   received before the ping.
/// - `Deliver`: broker to client, one per matching subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Subscribe {
        sid: u64,
        subject: String,
        queue: Option<String>,
    },

    Unsubscribe {
        sid: u64,
    },

    Publish {
        subject: String,
        reply_to: Option<String>,
        payload: Vec<u8>,
        retain: bool,
    },

    Ping {
        id: u64,
    },

    Pong {
        id: u64,
    },

    Deliver {
        sid: u64,
        message: Message,
    },
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(frame)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(anyhow::anyhow!("Frame too large: {} bytes", bytes.len()));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Reads one length-prefixed frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(anyhow::anyhow!("Frame too large: {} bytes", len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}
