//! Task-pull protocol
//!
//! This module defines the messages exchanged between the coordinator and its
//! workers, and the framing used when those messages cross a TCP connection.
//! Local workers exchange the same [`Message`] values over in-process channels.
//!
//! # Protocol Version
//!
//! Current version: 1
//!
//! # Message Flow
//!
//! One session per phase. Per node, before any task is pulled:
//!
//! ```text
//! Coordinator                     Node Service
//!     |                              |
//!     |-------- CONFIG ------------->|   run parameters + phase
//!     |<------- HELLO ---------------|   slots, grid shape, resolved count
//! ```
//!
//! Then per worker (local thread or node slot):
//!
//! ```text
//! Coordinator                     Worker
//!     |<------- READY ---------------|
//!     |-------- START(task) -------->|
//!     |<------- DONE(result) --------|
//!     |<------- READY ---------------|
//!     |   ...                        |
//!     |-------- EXIT --------------->|   no tasks left
//!     |<------- EXIT ----------------|   acknowledgement
//! ```
//!
//! On failure a worker sends `ERROR`; the coordinator broadcasts `ERROR` to
//! every live worker, each of which acknowledges with `EXIT`.
//!
//! # Message Framing
//!
//! Each frame is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: frame length][N bytes: MessagePack-serialized frame]
//! ```
//!
//! After the handshake every frame is an [`Envelope`] naming the worker slot
//! the message belongs to.

use crate::config::RunConfig;
use crate::grid::GridShape;
use crate::raster::LocationRaster;
use crate::sampling::IterationGrids;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// Coordinator and nodes must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame (100MB)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Global worker identifier, unique across all nodes of a session
pub type WorkerId = usize;

/// Session setup and framing errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the 100MB limit")]
    FrameTooLarge(usize),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("node {node} disagrees on setup: {detail}")]
    SetupMismatch { node: String, detail: String },

    #[error("unexpected {0} message during handshake")]
    UnexpectedMessage(&'static str),
}

/// Distributed phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Phase 3: one rasterization task per resolved location
    MeanSurface,
    /// Phase 4: one task per Monte Carlo iteration
    MonteCarlo,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::MeanSurface => write!(f, "mean surface"),
            Phase::MonteCarlo => write!(f, "monte carlo"),
        }
    }
}

/// Unit of work
///
/// Tasks are independent and idempotent; any worker may run any task and
/// rerunning one gives the same result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Index into the resolved location list
    RasterizeLocation(u32),
    /// Monte Carlo iteration index
    RunIteration(u32),
}

impl Task {
    /// Index of the task within its phase
    pub fn index(&self) -> u32 {
        match self {
            Task::RasterizeLocation(i) | Task::RunIteration(i) => *i,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Task::RasterizeLocation(_) => Phase::MeanSurface,
            Task::RunIteration(_) => Phase::MonteCarlo,
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::RasterizeLocation(i) => write!(f, "rasterize location {}", i),
            Task::RunIteration(i) => write!(f, "iteration {}", i),
        }
    }
}

/// Result of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskResult {
    Raster(LocationRaster),
    Iteration(IterationGrids),
}

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Run parameters for a session (Coordinator → Node)
    Config(ConfigMessage),

    /// Node setup summary (Node → Coordinator)
    ///
    /// The coordinator compares grid shape and resolved location count with
    /// its own before any task is dispatched.
    Hello(HelloMessage),

    /// Worker is idle and wants a task (Worker → Coordinator)
    Ready,

    /// Run a task (Coordinator → Worker)
    Start(Task),

    /// Task finished (Worker → Coordinator)
    Done { task: Task, result: TaskResult },

    /// No more work (Coordinator → Worker), and its acknowledgement
    /// (Worker → Coordinator)
    Exit,

    /// Failure report (Worker → Coordinator) or cancellation broadcast
    /// (Coordinator → Worker)
    Error(ErrorMessage),
}

impl Message {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Config(_) => "CONFIG",
            Message::Hello(_) => "HELLO",
            Message::Ready => "READY",
            Message::Start(_) => "START",
            Message::Done { .. } => "DONE",
            Message::Exit => "EXIT",
            Message::Error(_) => "ERROR",
        }
    }
}

/// Configuration message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMessage {
    /// Protocol version (must match)
    pub protocol_version: u32,

    /// Phase this session runs
    pub phase: Phase,

    /// Complete run configuration, seed included
    pub config: RunConfig,

    /// First global worker id assigned to this node's slots
    pub worker_id_start: WorkerId,
}

/// Hello message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version
    pub protocol_version: u32,

    /// Node identifier
    pub node_id: String,

    /// Number of worker slots on this node
    pub slots: usize,

    /// Coarse grid the node built
    pub grid: GridShape,

    /// Locations that survived resolution on the node
    pub resolved_locations: usize,
}

/// Error message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Reporter (worker or node identifier)
    pub node_id: String,

    /// Error description
    pub error: String,
}

impl ErrorMessage {
    pub fn new(node_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            error: error.into(),
        }
    }
}

/// A message addressed to or sent by one worker slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub slot: WorkerId,
    pub message: Message,
}

/// Serialize a frame to bytes
///
/// Prepends a 4-byte length field.
///
/// # Frame Format
///
/// ```text
/// [4 bytes: frame length (little-endian u32)][N bytes: MessagePack frame]
/// ```
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    // Named fields so internally tagged config enums survive the round trip
    let msg_bytes = rmp_serde::to_vec_named(msg).context("Failed to serialize message")?;
    if msg_bytes.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(msg_bytes.len()).into());
    }

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a frame from bytes
///
/// Expects a 4-byte length prefix followed by the MessagePack body.
///
/// # Returns
///
/// Returns (frame, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read one frame from a stream (whole socket or read half)
pub async fn read_message<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check: reject messages > 100MB
    if msg_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(msg_len).into());
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")
}

/// Write one frame to a stream and flush it
pub async fn write_message<W, T>(stream: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = serialize_message(msg)?;

    stream.write_all(&framed).await.context("Failed to write message")?;

    // Flush to ensure message is sent immediately
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::RasterOutcome;
    use crate::sampling::SampleCounters;

    #[test]
    fn test_serialize_deserialize_start() {
        let msg = Message::Start(Task::RunIteration(17));

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, consumed): (Message, usize) = deserialize_message(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        match deserialized {
            Message::Start(task) => assert_eq!(task, Task::RunIteration(17)),
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_serialize_deserialize_done_raster() {
        let raster = LocationRaster {
            deltas: vec![(3, 12.5), (9, 0.125)],
            outcome: RasterOutcome::Area { fine_cells: 8 },
            dropped_out_of_grid: 1,
        };
        let msg = Message::Done {
            task: Task::RasterizeLocation(4),
            result: TaskResult::Raster(raster.clone()),
        };

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, _): (Message, usize) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Done { task, result } => {
                assert_eq!(task, Task::RasterizeLocation(4));
                assert_eq!(result, TaskResult::Raster(raster));
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_serialize_deserialize_envelope() {
        let grids = IterationGrids {
            iteration: 2,
            aid_sum: vec![0, 5, 0, 1],
            location_count: vec![0, 1, 0, 1],
            counters: SampleCounters {
                placed: 2,
                ..Default::default()
            },
        };
        let envelope = Envelope {
            slot: 7,
            message: Message::Done {
                task: Task::RunIteration(2),
                result: TaskResult::Iteration(grids.clone()),
            },
        };

        let bytes = serialize_message(&envelope).unwrap();
        let (deserialized, _): (Envelope, usize) = deserialize_message(&bytes).unwrap();

        assert_eq!(deserialized.slot, 7);
        match deserialized.message {
            Message::Done {
                result: TaskResult::Iteration(got),
                ..
            } => assert_eq!(got, grids),
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_serialize_deserialize_error() {
        let msg = Message::Error(ErrorMessage::new("10.0.1.10", "Test error"));

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, consumed): (Message, usize) = deserialize_message(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());
        match deserialized {
            Message::Error(err) => {
                assert_eq!(err.node_id, "10.0.1.10");
                assert_eq!(err.error, "Test error");
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_serialize_deserialize_config() {
        let mut config = RunConfig::new("Uganda", "UGA", 0.05, 100);
        config.sampling.seed = Some(1234);
        let msg = Message::Config(ConfigMessage {
            protocol_version: PROTOCOL_VERSION,
            phase: Phase::MonteCarlo,
            config: config.clone(),
            worker_id_start: 8,
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, _): (Message, usize) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Config(got) => {
                assert_eq!(got.phase, Phase::MonteCarlo);
                assert_eq!(got.worker_id_start, 8);
                // Lookup table and seed must arrive intact for nodes to agree
                assert_eq!(got.config, config);
            }
            other => panic!("Wrong message type: {}", other.kind()),
        }
    }

    #[test]
    fn test_message_framing() {
        let bytes = serialize_message(&Message::Exit).unwrap();

        assert!(bytes.len() >= 4);
        let msg_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + msg_len);
    }

    #[test]
    fn test_incomplete_frame() {
        let bytes = serialize_message(&Message::Ready).unwrap();
        assert!(deserialize_message::<Message>(&bytes[..2]).is_err());
        assert!(deserialize_message::<Message>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_task_phase() {
        assert_eq!(Task::RasterizeLocation(3).phase(), Phase::MeanSurface);
        assert_eq!(Task::RunIteration(3).phase(), Phase::MonteCarlo);
        assert_eq!(Task::RunIteration(3).index(), 3);
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_message(&mut client, &Message::Start(Task::RasterizeLocation(1))).await.unwrap();
        write_message(&mut client, &Message::Exit).await.unwrap();

        let first: Message = read_message(&mut server).await.unwrap();
        let second: Message = read_message(&mut server).await.unwrap();
        assert!(matches!(first, Message::Start(Task::RasterizeLocation(1))));
        assert!(matches!(second, Message::Exit));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();

        let result: Result<Message> = read_message(&mut server).await;
        assert!(result.is_err());
    }
}
