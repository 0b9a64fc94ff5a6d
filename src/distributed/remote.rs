//! Remote worker pool
//!
//! Connects to node services and presents their slots to the coordinator as
//! ordinary workers.
//!
//! # Session
//!
//! One TCP session per node per phase:
//!
//! 1. send `Config` with the run configuration and the node's first global
//!    worker id
//! 2. read `Hello`, check protocol version, grid shape and resolved count
//! 3. relay [`Envelope`]s both ways until every slot of the node has stopped
//!
//! # Relay Tasks
//!
//! Per node:
//! - **writer**: envelopes from the slot forwarders → socket
//! - **forwarder** (one per slot): coordinator messages for the slot →
//!   envelopes
//! - **reader**: socket → coordinator inbox
//!
//! If the connection drops, the reader reports an `Error` for every slot that
//! has not stopped yet, so the coordinator fails the phase instead of waiting.

use crate::distributed::coordinator::WorkerPool;
use crate::distributed::protocol::{
    read_message, write_message, ConfigMessage, Envelope, ErrorMessage, HelloMessage, Message, Phase,
    ProtocolError, WorkerId, PROTOCOL_VERSION,
};
use crate::pipeline::RunContext;
use crate::Result;
use anyhow::Context;
use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Build the node address list from `--host-list` or a clients file
///
/// Addresses without a port get `default_port`. Blank lines and `#` comments
/// in the file are skipped.
pub fn parse_node_list(host_list: Option<&str>, clients_file: Option<&Path>, default_port: u16) -> Result<Vec<String>> {
    let with_port = |addr: &str| {
        if addr.contains(':') {
            addr.to_string()
        } else {
            format!("{}:{}", addr, default_port)
        }
    };

    let nodes: Vec<String> = if let Some(host_list) = host_list {
        host_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(with_port)
            .collect()
    } else if let Some(clients_file) = clients_file {
        let content = std::fs::read_to_string(clients_file)
            .with_context(|| format!("Failed to read clients file: {}", clients_file.display()))?;
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(with_port)
            .collect()
    } else {
        anyhow::bail!("Coordinator mode requires --host-list or --clients-file");
    };

    if nodes.is_empty() {
        anyhow::bail!("Node list is empty");
    }
    Ok(nodes)
}

/// Compare a node's setup with ours
fn check_hello(addr: &str, hello: &HelloMessage, context: &RunContext) -> Result<()> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: hello.protocol_version,
        }
        .into());
    }
    let grid = context.grid().shape();
    if hello.grid != grid {
        return Err(ProtocolError::SetupMismatch {
            node: format!("{} ({})", hello.node_id, addr),
            detail: format!(
                "grid {}x{}, expected {}x{}",
                hello.grid.rows, hello.grid.cols, grid.rows, grid.cols
            ),
        }
        .into());
    }
    if hello.resolved_locations != context.locations().len() {
        return Err(ProtocolError::SetupMismatch {
            node: format!("{} ({})", hello.node_id, addr),
            detail: format!(
                "{} resolved locations, expected {}",
                hello.resolved_locations,
                context.locations().len()
            ),
        }
        .into());
    }
    if hello.slots == 0 {
        anyhow::bail!("Node {} ({}) offers no worker slots", hello.node_id, addr);
    }
    Ok(())
}

/// Open a session with one node and return its `Hello`
async fn handshake(
    addr: &str,
    phase: Phase,
    context: &RunContext,
    worker_id_start: WorkerId,
) -> Result<(TcpStream, HelloMessage)> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to node {}", addr))?;
    stream.set_nodelay(true)?;

    let config = ConfigMessage {
        protocol_version: PROTOCOL_VERSION,
        phase,
        config: context.config().clone(),
        worker_id_start,
    };
    write_message(&mut stream, &Message::Config(config))
        .await
        .with_context(|| format!("Failed to send CONFIG to {}", addr))?;

    let hello = match read_message(&mut stream)
        .await
        .with_context(|| format!("Failed to read HELLO from {}", addr))?
    {
        Message::Hello(hello) => hello,
        Message::Error(err) => anyhow::bail!("Node {} ({}) failed setup: {}", err.node_id, addr, err.error),
        other => return Err(ProtocolError::UnexpectedMessage(other.kind()).into()),
    };
    check_hello(addr, &hello, context)?;

    Ok((stream, hello))
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut envelopes: mpsc::UnboundedReceiver<Envelope>) -> Result<()> {
    while let Some(envelope) = envelopes.recv().await {
        write_message(&mut write_half, &envelope).await?;
    }
    // Tells the node no more messages are coming
    let _ = write_half.shutdown().await;
    Ok(())
}

async fn reader_loop(
    addr: String,
    mut read_half: OwnedReadHalf,
    slots: Range<WorkerId>,
    inbox: mpsc::UnboundedSender<(WorkerId, Message)>,
) -> Result<()> {
    let mut stopped = HashSet::new();

    while stopped.len() < slots.len() {
        match read_message::<_, Envelope>(&mut read_half).await {
            Ok(Envelope { slot, message }) => {
                if !slots.contains(&slot) {
                    tracing::warn!(node = %addr, slot, "Message for a slot this node does not own");
                    continue;
                }
                if matches!(message, Message::Exit | Message::Error(_)) {
                    stopped.insert(slot);
                }
                if inbox.send((slot, message)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(node = %addr, error = %format!("{:#}", e), "Node connection lost");
                let reason = format!("connection lost: {:#}", e);
                for slot in slots.clone().filter(|s| !stopped.contains(s)) {
                    let _ = inbox.send((slot, Message::Error(ErrorMessage::new(addr.clone(), reason.clone()))));
                }
                break;
            }
        }
    }

    Ok(())
}

/// Connect to every node and build one pool from their slots
///
/// Slot ids are assigned in node order: the first node's slots are
/// `0..slots`, the next node's follow.
pub async fn connect_pool(nodes: &[String], phase: Phase, context: &RunContext) -> Result<WorkerPool> {
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let mut outboxes = Vec::new();
    let mut handles = Vec::new();

    for addr in nodes {
        let start = outboxes.len();
        let (stream, hello) = handshake(addr, phase, context, start).await?;
        let slots = start..start + hello.slots;
        tracing::info!(node = %hello.node_id, addr = %addr, slots = hello.slots, first_worker = start, "Node connected");

        let (read_half, write_half) = stream.into_split();
        let (to_node, envelopes) = mpsc::unbounded_channel();

        for slot in slots.clone() {
            let (slot_tx, mut slot_rx) = mpsc::unbounded_channel::<Message>();
            outboxes.push(slot_tx);
            let to_node = to_node.clone();
            handles.push(tokio::spawn(async move {
                while let Some(message) = slot_rx.recv().await {
                    if to_node.send(Envelope { slot, message }).is_err() {
                        break;
                    }
                }
                Ok(())
            }));
        }
        drop(to_node);

        handles.push(tokio::spawn(writer_loop(write_half, envelopes)));
        handles.push(tokio::spawn(reader_loop(addr.clone(), read_half, slots, inbox_tx.clone())));
    }

    let mut pool = WorkerPool::new(inbox, outboxes);
    for handle in handles {
        pool.add_task(handle);
    }
    Ok(pool)
}
