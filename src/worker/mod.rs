//! Worker side of the task-pull protocol
//!
//! A worker is a blocking loop on an OS thread. It announces itself with
//! `Ready`, runs each `Start(task)` through its [`TaskExecutor`], reports the
//! result with `Done` and asks for more until it is told to stop.
//!
//! # Architecture
//!
//! The same worker serves both deployments:
//! - **Local**: threads spawned by the coordinator process
//! - **Remote**: slots of a node service, whose messages the node relays over
//!   TCP
//!
//! In both cases the worker only sees a [`WorkerLink`]: an inbox of messages
//! from the coordinator and a shared outbox tagged with its global id.
//!
//! # Stopping
//!
//! - `Exit`: acknowledged with `Exit`, the worker completes
//! - `Error` (cancellation broadcast): acknowledged with `Exit`, the worker is
//!   cancelled
//! - task failure: reported with `Error`, the worker stops without waiting
//!
//! The inbox is polled between tasks so a pending cancellation is seen before
//! the worker asks for another task.

use crate::distributed::protocol::{ErrorMessage, Message, Task, TaskResult, WorkerId};
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Runs tasks for a worker
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task) -> Result<TaskResult>;
}

/// A worker's two message channels
#[derive(Debug)]
pub struct WorkerLink {
    pub id: WorkerId,
    pub inbox: mpsc::UnboundedReceiver<Message>,
    pub outbox: mpsc::UnboundedSender<(WorkerId, Message)>,
}

impl WorkerLink {
    fn send(&self, message: Message) -> Result<()> {
        self.outbox
            .send((self.id, message))
            .map_err(|_| anyhow::anyhow!("Worker {}: coordinator channel closed", self.id))
    }
}

/// How a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Told to exit after the work ran out
    Completed { tasks: u64 },
    /// Stopped by a cancellation broadcast
    Cancelled { tasks: u64 },
    /// A task failed and the failure was reported
    Failed { tasks: u64 },
}

impl WorkerOutcome {
    pub fn tasks(&self) -> u64 {
        match self {
            WorkerOutcome::Completed { tasks }
            | WorkerOutcome::Cancelled { tasks }
            | WorkerOutcome::Failed { tasks } => *tasks,
        }
    }
}

/// Worker loop
pub struct Worker<E: TaskExecutor> {
    link: WorkerLink,
    executor: Arc<E>,
    /// Name used in error reports (node id for remote slots)
    reporter: String,
}

impl<E: TaskExecutor> Worker<E> {
    pub fn new(link: WorkerLink, executor: Arc<E>, reporter: impl Into<String>) -> Self {
        Self {
            link,
            executor,
            reporter: reporter.into(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.link.id
    }

    /// Run until exit, cancellation or task failure
    ///
    /// Blocks the calling thread; never call it from an async task.
    pub fn run(mut self) -> Result<WorkerOutcome> {
        let id = self.link.id;
        let mut tasks = 0u64;

        self.link.send(Message::Ready)?;

        loop {
            let message = self
                .link
                .inbox
                .blocking_recv()
                .ok_or_else(|| anyhow::anyhow!("Worker {}: inbox closed before exit", id))?;

            match message {
                Message::Start(task) => {
                    tracing::trace!(worker = id, %task, "Task started");
                    match self.executor.execute(task) {
                        Ok(result) => {
                            tasks += 1;
                            self.link.send(Message::Done { task, result })?;
                        }
                        Err(e) => {
                            tracing::error!(worker = id, %task, error = %format!("{:#}", e), "Task failed");
                            let error = ErrorMessage::new(
                                self.reporter.clone(),
                                format!("worker {}: {} failed: {:#}", id, task, e),
                            );
                            self.link.send(Message::Error(error))?;
                            return Ok(WorkerOutcome::Failed { tasks });
                        }
                    }

                    match self.link.inbox.try_recv() {
                        Ok(Message::Error(_)) => {
                            self.link.send(Message::Exit)?;
                            return Ok(WorkerOutcome::Cancelled { tasks });
                        }
                        Ok(Message::Exit) => {
                            self.link.send(Message::Exit)?;
                            return Ok(WorkerOutcome::Completed { tasks });
                        }
                        Ok(other) => {
                            tracing::warn!(worker = id, message = other.kind(), "Unexpected message between tasks");
                        }
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => {
                            anyhow::bail!("Worker {}: inbox closed before exit", id);
                        }
                    }

                    self.link.send(Message::Ready)?;
                }
                Message::Exit => {
                    self.link.send(Message::Exit)?;
                    tracing::debug!(worker = id, tasks, "Worker exiting");
                    return Ok(WorkerOutcome::Completed { tasks });
                }
                Message::Error(err) => {
                    tracing::debug!(worker = id, reason = %err.error, "Worker cancelled");
                    self.link.send(Message::Exit)?;
                    return Ok(WorkerOutcome::Cancelled { tasks });
                }
                other => {
                    tracing::warn!(worker = id, message = other.kind(), "Unexpected message");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{IterationGrids, SampleCounters};
    use std::sync::Mutex;

    struct Echo;

    impl TaskExecutor for Echo {
        fn execute(&self, task: Task) -> Result<TaskResult> {
            match task {
                Task::RunIteration(i) if i == 13 => anyhow::bail!("unlucky iteration"),
                Task::RunIteration(i) => Ok(TaskResult::Iteration(IterationGrids {
                    iteration: i,
                    aid_sum: vec![i as u64],
                    location_count: vec![1],
                    counters: SampleCounters::default(),
                })),
                Task::RasterizeLocation(_) => anyhow::bail!("not supported"),
            }
        }
    }

    fn spawn_worker() -> (
        mpsc::UnboundedSender<Message>,
        mpsc::UnboundedReceiver<(WorkerId, Message)>,
        std::thread::JoinHandle<Result<WorkerOutcome>>,
    ) {
        let (to_worker, inbox) = mpsc::unbounded_channel();
        let (outbox, from_worker) = mpsc::unbounded_channel();
        let link = WorkerLink { id: 3, inbox, outbox };
        let handle = std::thread::spawn(move || Worker::new(link, Arc::new(Echo), "test").run());
        (to_worker, from_worker, handle)
    }

    #[test]
    fn test_worker_runs_until_exit() {
        let (to_worker, mut from_worker, handle) = spawn_worker();

        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Ready))));
        to_worker.send(Message::Start(Task::RunIteration(5))).unwrap();
        match from_worker.blocking_recv() {
            Some((3, Message::Done { task, result: TaskResult::Iteration(grids) })) => {
                assert_eq!(task, Task::RunIteration(5));
                assert_eq!(grids.aid_sum, vec![5]);
            }
            other => panic!("expected DONE, got {:?}", other),
        }
        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Ready))));

        to_worker.send(Message::Exit).unwrap();
        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Exit))));
        assert_eq!(handle.join().unwrap().unwrap(), WorkerOutcome::Completed { tasks: 1 });
    }

    #[test]
    fn test_worker_reports_task_failure() {
        let (to_worker, mut from_worker, handle) = spawn_worker();

        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Ready))));
        to_worker.send(Message::Start(Task::RunIteration(13))).unwrap();
        match from_worker.blocking_recv() {
            Some((3, Message::Error(err))) => assert!(err.error.contains("unlucky")),
            other => panic!("expected ERROR, got {:?}", other),
        }
        assert_eq!(handle.join().unwrap().unwrap(), WorkerOutcome::Failed { tasks: 0 });
    }

    #[test]
    fn test_worker_acknowledges_cancellation() {
        let (to_worker, mut from_worker, handle) = spawn_worker();

        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Ready))));
        to_worker.send(Message::Error(ErrorMessage::new("coordinator", "abort"))).unwrap();
        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Exit))));
        assert_eq!(handle.join().unwrap().unwrap(), WorkerOutcome::Cancelled { tasks: 0 });
    }

    /// Holds every task until the test opens the gate
    struct Gated {
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl TaskExecutor for Gated {
        fn execute(&self, task: Task) -> Result<TaskResult> {
            self.gate
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| anyhow::anyhow!("gate dropped"))?;
            Echo.execute(task)
        }
    }

    #[test]
    fn test_worker_sees_pending_cancellation_between_tasks() {
        let (open, gate) = std::sync::mpsc::channel();
        let (to_worker, inbox) = mpsc::unbounded_channel();
        let (outbox, mut from_worker) = mpsc::unbounded_channel();
        let link = WorkerLink { id: 3, inbox, outbox };
        let executor = Arc::new(Gated { gate: Mutex::new(gate) });
        let handle = std::thread::spawn(move || Worker::new(link, executor, "test").run());

        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Ready))));
        // The broadcast is queued while the task is still running: the worker
        // must stop after the task instead of asking for more
        to_worker.send(Message::Start(Task::RunIteration(1))).unwrap();
        to_worker.send(Message::Error(ErrorMessage::new("coordinator", "abort"))).unwrap();
        open.send(()).unwrap();

        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Done { .. }))));
        assert!(matches!(from_worker.blocking_recv(), Some((3, Message::Exit))));
        assert_eq!(handle.join().unwrap().unwrap(), WorkerOutcome::Cancelled { tasks: 1 });
    }
}
