//! Node service for distributed mode
//!
//! This module implements the service that runs on each node in distributed
//! mode. The node service:
//! - Listens for connections from the coordinator
//! - Receives the run configuration and phase (one session per phase)
//! - Performs the same setup as the coordinator and reports it in `Hello`
//! - Hosts worker slots (OS threads) and relays their messages over TCP
//!
//! Setup is cached between sessions: the second phase of a run reuses the
//! context built for the first when the configuration is unchanged.
//!
//! If the coordinator disappears, every slot receives an `Error` and stops
//! after its current task.

use crate::config::RunConfig;
use crate::distributed::protocol::{
    read_message, write_message, ConfigMessage, Envelope, ErrorMessage, HelloMessage, Message, ProtocolError,
    WorkerId, PROTOCOL_VERSION,
};
use crate::pipeline::RunContext;
use crate::worker::{Worker, WorkerLink};
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Node service
///
/// Runs on each node in distributed mode, hosting worker slots for the
/// coordinator.
pub struct NodeService {
    /// Port to listen on
    listen_port: u16,

    /// Node identifier (hostname)
    node_id: String,

    /// Worker slots offered per session
    slots: usize,

    /// Context of the last session's configuration
    cache: Option<(RunConfig, Arc<RunContext>)>,
}

impl NodeService {
    /// Create a new node service
    pub fn new(listen_port: u16, slots: usize) -> Result<Self> {
        if slots == 0 {
            anyhow::bail!("Node service needs at least one worker slot");
        }

        Ok(Self {
            listen_port,
            node_id: get_node_id(),
            slots,
            cache: None,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run the node service
    ///
    /// Listens for coordinator sessions and serves them one at a time.
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .context("Failed to bind node service")?;

        println!("Node service listening on port {}", self.listen_port);
        println!("Node ID: {}", self.node_id);
        println!("Worker slots: {}", self.slots);
        println!("Waiting for coordinator connection...");

        self.serve(listener, None).await
    }

    /// Serve sessions from an already bound listener
    ///
    /// Stops after `sessions` sessions when given, otherwise runs forever.
    pub async fn serve(mut self, listener: TcpListener, sessions: Option<usize>) -> Result<()> {
        let mut served = 0usize;
        while sessions.map_or(true, |limit| served < limit) {
            let (stream, peer) = listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            tracing::info!(%peer, "Coordinator connected");
            if let Err(e) = self.handle_session(stream).await {
                tracing::error!(%peer, error = %format!("{:#}", e), "Session failed");
            }
            served += 1;
            tracing::info!("Session complete, waiting for next connection");
        }
        Ok(())
    }

    /// Handle one phase session
    async fn handle_session(&mut self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;

        let config_msg: ConfigMessage = match read_message(&mut stream).await? {
            Message::Config(msg) => msg,
            other => return Err(ProtocolError::UnexpectedMessage(other.kind()).into()),
        };

        // Validate protocol version
        if config_msg.protocol_version != PROTOCOL_VERSION {
            let err = ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: config_msg.protocol_version,
            };
            let error = ErrorMessage::new(self.node_id.clone(), err.to_string());
            write_message(&mut stream, &Message::Error(error)).await?;
            return Err(err.into());
        }

        tracing::info!(
            phase = %config_msg.phase,
            country = %config_msg.config.country,
            first_worker = config_msg.worker_id_start,
            "Received configuration"
        );

        let context = match self.context_for(&config_msg.config).await {
            Ok(context) => context,
            Err(e) => {
                let error = ErrorMessage::new(self.node_id.clone(), format!("{:#}", e));
                write_message(&mut stream, &Message::Error(error)).await?;
                return Err(e);
            }
        };

        let hello = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            node_id: self.node_id.clone(),
            slots: self.slots,
            grid: context.grid().shape(),
            resolved_locations: context.locations().len(),
        };
        write_message(&mut stream, &Message::Hello(hello)).await?;

        run_slots(
            stream,
            context,
            self.node_id.clone(),
            config_msg.worker_id_start,
            self.slots,
        )
        .await
    }

    /// Cached context for a configuration, preparing a new one if it changed
    async fn context_for(&mut self, config: &RunConfig) -> Result<Arc<RunContext>> {
        if let Some((cached, context)) = &self.cache {
            if cached == config {
                tracing::debug!("Reusing prepared run context");
                return Ok(context.clone());
            }
        }

        let owned = config.clone();
        let context = tokio::task::spawn_blocking(move || RunContext::prepare(&owned))
            .await
            .context("Setup task failed")??;
        let context = Arc::new(context);
        self.cache = Some((config.clone(), context.clone()));
        Ok(context)
    }
}

/// Run the slots of one session until every slot has stopped
async fn run_slots(
    stream: TcpStream,
    context: Arc<RunContext>,
    node_id: String,
    first: WorkerId,
    slots: usize,
) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbox, mut from_slots) = mpsc::unbounded_channel::<(WorkerId, Message)>();

    let mut inboxes = HashMap::with_capacity(slots);
    let mut threads = Vec::with_capacity(slots);
    for id in first..first + slots {
        let (to_slot, inbox) = mpsc::unbounded_channel();
        inboxes.insert(id, to_slot);

        let link = WorkerLink {
            id,
            inbox,
            outbox: outbox.clone(),
        };
        let worker = Worker::new(link, context.clone(), node_id.clone());
        let handle = std::thread::Builder::new()
            .name(format!("aidgrid-slot-{}", id))
            .spawn(move || worker.run())
            .with_context(|| format!("Failed to spawn slot thread {}", id))?;
        threads.push(handle);
    }
    drop(outbox);

    // Frame reads are not cancel-safe, so they get their own task
    let (net_tx, mut net_rx) = mpsc::unbounded_channel::<Result<Envelope>>();
    let reader = tokio::spawn(async move {
        loop {
            let frame = read_message::<_, Envelope>(&mut read_half).await;
            let failed = frame.is_err();
            if net_tx.send(frame).is_err() || failed {
                break;
            }
        }
    });

    let cancel_all = |inboxes: &HashMap<WorkerId, mpsc::UnboundedSender<Message>>, reason: String| {
        for to_slot in inboxes.values() {
            let _ = to_slot.send(Message::Error(ErrorMessage::new("coordinator", reason.clone())));
        }
    };

    let mut connected = true;
    let mut stopped = 0usize;
    loop {
        tokio::select! {
            outgoing = from_slots.recv() => match outgoing {
                Some((slot, message)) => {
                    if matches!(message, Message::Exit | Message::Error(_)) {
                        stopped += 1;
                    }
                    if connected {
                        if let Err(e) = write_message(&mut write_half, &Envelope { slot, message }).await {
                            tracing::error!(error = %format!("{:#}", e), "Failed to send to coordinator");
                            connected = false;
                            cancel_all(&inboxes, "coordinator connection lost".to_string());
                        }
                    }
                }
                // Every slot thread has dropped its outbox
                None => break,
            },
            incoming = net_rx.recv(), if connected => match incoming {
                Some(Ok(Envelope { slot, message })) => match inboxes.get(&slot) {
                    Some(to_slot) => {
                        let _ = to_slot.send(message);
                    }
                    None => tracing::warn!(slot, "Message for unknown slot"),
                },
                // Coordinator closes its side once every slot has exited
                Some(Err(_)) if stopped >= slots => {
                    tracing::debug!("Coordinator closed the session");
                    connected = false;
                }
                Some(Err(e)) => {
                    tracing::error!(error = %format!("{:#}", e), "Coordinator connection lost");
                    connected = false;
                    cancel_all(&inboxes, format!("coordinator connection lost: {:#}", e));
                }
                None => {
                    connected = false;
                    cancel_all(&inboxes, "coordinator connection lost".to_string());
                }
            },
        }
    }

    reader.abort();
    let _ = write_half.shutdown().await;

    let mut tasks = 0u64;
    for handle in threads {
        let outcome = tokio::task::spawn_blocking(move || handle.join())
            .await
            .context("Join task failed")?
            .map_err(|_| anyhow::anyhow!("Slot thread panicked"))??;
        tasks += outcome.tasks();
    }
    tracing::info!(slots, tasks, "Slots finished");

    Ok(())
}

/// Get node identifier (hostname)
fn get_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
