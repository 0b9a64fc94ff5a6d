//! Task distribution
//!
//! Both distributed phases run through the same task-pull coordinator,
//! whether the workers are local threads or slots on remote nodes.
//!
//! # Architecture
//!
//! - **Coordinator**: hands out tasks to idle workers, collects results,
//!   requeues timed-out tasks and cancels everyone on failure
//! - **Node Service**: runs on nodes, repeats the setup, hosts worker slots
//! - **Workers**: threads executing one task at a time
//!
//! # Modules
//!
//! - `protocol`: Message definitions and framing
//! - `coordinator`: Task-pull loop and worker pool
//! - `local`: Worker threads in the coordinator's process
//! - `remote`: Worker slots on node services, reached over TCP
//! - `node_service`: Node side of the TCP session

pub mod coordinator;
pub mod local;
pub mod node_service;
pub mod protocol;
pub mod remote;

// Re-export key types
pub use coordinator::{DispatchSettings, PhaseReport, ResultSink, TaskCoordinator, WorkerPool};
pub use node_service::NodeService;
pub use protocol::{ErrorMessage, Message, Phase, Task, TaskResult, PROTOCOL_VERSION};
