//! Task coordinator
//!
//! Master side of the task-pull protocol. One [`TaskCoordinator`] runs one
//! phase: it answers every `Ready` with the next task, merges every `Done`
//! into the phase's [`ResultSink`], and tells workers to exit once the work
//! runs out. The phase ends when every worker has exited.
//!
//! # Worker States
//!
//! ```text
//! Idle ──READY──> Ready ──START──> Dispatched ──DONE──> Idle
//!                   │
//!                   └──EXIT──> Exiting ──EXIT ack──> Exited
//!
//! any live state ──ERROR broadcast──> Cancelling ──EXIT ack──> Exited
//! ```
//!
//! # Failure
//!
//! A worker's `Error` fails the phase. The reporting worker is counted as
//! exited; every other live worker receives an `Error` broadcast and is
//! waited on until it acknowledges with `Exit`. Results arriving from
//! cancelling workers are discarded.
//!
//! # Timeouts
//!
//! With a task timeout configured, an overdue task is requeued and handed to
//! the next free worker (up to `max_task_retries` times). The overdue worker
//! is sent an `Error` and becomes `Cancelling`; its late result is dropped and
//! the phase waits for its `Exit`, which comes once its current task returns.
//! A task that never returns is not preempted. The last live worker is never
//! cancelled this way, and a result it delivers late still counts if the
//! requeued copy has not finished first. Later duplicates are counted and
//! dropped. While a timeout is configured, free workers are parked rather
//! than told to exit until every task has completed, so requeued work always
//! has somewhere to go.

use crate::distributed::protocol::{ErrorMessage, Message, Task, TaskResult, WorkerId};
use crate::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Receives the results of a phase
pub trait ResultSink {
    fn accept(&mut self, task: Task, result: TaskResult) -> Result<()>;
}

/// Dispatch knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSettings {
    /// Requeue a task not finished within this long
    pub task_timeout: Option<Duration>,
    /// Requeues allowed per task before the phase fails
    pub max_task_retries: u32,
}

/// Coordinator-side handles to a set of workers
///
/// `outboxes[id]` reaches worker `id`; every worker reports into `inbox`.
/// Background threads and tasks that host or relay the workers are joined by
/// [`WorkerPool::join`].
pub struct WorkerPool {
    pub inbox: mpsc::UnboundedReceiver<(WorkerId, Message)>,
    pub outboxes: Vec<mpsc::UnboundedSender<Message>>,
    threads: Vec<std::thread::JoinHandle<Result<()>>>,
    tasks: Vec<tokio::task::JoinHandle<Result<()>>>,
}

impl WorkerPool {
    pub fn new(
        inbox: mpsc::UnboundedReceiver<(WorkerId, Message)>,
        outboxes: Vec<mpsc::UnboundedSender<Message>>,
    ) -> Self {
        Self {
            inbox,
            outboxes,
            threads: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn add_thread(&mut self, handle: std::thread::JoinHandle<Result<()>>) {
        self.threads.push(handle);
    }

    pub fn add_task(&mut self, handle: tokio::task::JoinHandle<Result<()>>) {
        self.tasks.push(handle);
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }

    /// Close the channels and wait for every thread and task
    pub async fn join(self) -> Result<()> {
        let WorkerPool {
            inbox,
            outboxes,
            threads,
            tasks,
        } = self;
        drop(outboxes);
        drop(inbox);

        let mut first_error = None;
        for handle in threads {
            let joined = tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| anyhow::anyhow!("Join task failed: {}", e))?;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(anyhow::anyhow!("Worker thread panicked"));
                }
            }
        }
        for handle in tasks {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(anyhow::anyhow!("Relay task failed: {}", e));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Coordinator's view of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    /// Parked: asked for work while only in-flight tasks remained
    Ready,
    Dispatched {
        task: Task,
        deadline: Option<Instant>,
    },
    Exiting,
    Cancelling,
    Exited,
}

impl WorkerState {
    fn is_live(&self) -> bool {
        !matches!(self, WorkerState::Exiting | WorkerState::Cancelling | WorkerState::Exited)
    }
}

/// Counters for one finished phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub tasks: usize,
    pub workers: usize,
    pub starts_sent: u64,
    pub exits_sent: u64,
    pub redispatched: u64,
    pub duplicates: u64,
    pub elapsed: Duration,
}

/// Master side of one phase
pub struct TaskCoordinator {
    tasks: Vec<Task>,
    settings: DispatchSettings,
    next: usize,
    retry: VecDeque<Task>,
    attempts: HashMap<Task, u32>,
    completed: HashSet<Task>,
    states: Vec<WorkerState>,
    parked: VecDeque<WorkerId>,
    failure: Option<anyhow::Error>,
    report: PhaseReport,
}

impl TaskCoordinator {
    pub fn new(tasks: Vec<Task>, settings: DispatchSettings) -> Self {
        let count = tasks.len();
        Self {
            tasks,
            settings,
            next: 0,
            retry: VecDeque::new(),
            attempts: HashMap::new(),
            completed: HashSet::new(),
            states: Vec::new(),
            parked: VecDeque::new(),
            failure: None,
            report: PhaseReport {
                tasks: count,
                workers: 0,
                starts_sent: 0,
                exits_sent: 0,
                redispatched: 0,
                duplicates: 0,
                elapsed: Duration::ZERO,
            },
        }
    }

    /// Run the phase to completion
    ///
    /// Returns once every worker has exited. Fails when a worker reported an
    /// error, a task exhausted its retries, the sink rejected a result or the
    /// workers vanished.
    pub async fn run<S: ResultSink>(mut self, pool: &mut WorkerPool, sink: &mut S) -> Result<PhaseReport> {
        let started = Instant::now();
        self.states = vec![WorkerState::Idle; pool.len()];
        self.report.workers = pool.len();

        if pool.is_empty() {
            anyhow::bail!("No workers available");
        }

        tracing::debug!(tasks = self.tasks.len(), workers = pool.len(), "Dispatch started");

        while self.states.iter().any(|s| *s != WorkerState::Exited) {
            let received = match self.next_deadline() {
                Some(deadline) => match tokio::time::timeout_at(deadline, pool.inbox.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.expire_overdue(pool, Instant::now());
                        continue;
                    }
                },
                None => pool.inbox.recv().await,
            };

            let Some((worker, message)) = received else {
                let live = self.states.iter().filter(|s| **s != WorkerState::Exited).count();
                anyhow::bail!("Worker channels closed with {} workers not exited", live);
            };

            if worker >= self.states.len() {
                tracing::warn!(worker, message = message.kind(), "Message from unknown worker");
                continue;
            }

            self.handle(pool, sink, worker, message);
        }

        self.report.elapsed = started.elapsed();

        if let Some(failure) = self.failure {
            return Err(failure);
        }
        if self.completed.len() != self.tasks.len() {
            anyhow::bail!(
                "All workers exited with {} of {} tasks completed",
                self.completed.len(),
                self.tasks.len()
            );
        }

        Ok(self.report)
    }

    fn handle<S: ResultSink>(&mut self, pool: &WorkerPool, sink: &mut S, worker: WorkerId, message: Message) {
        match message {
            Message::Ready => {
                if self.states[worker].is_live() {
                    self.assign(pool, worker);
                }
            }
            Message::Done { task, result } => {
                if let WorkerState::Dispatched { task: current, .. } = self.states[worker] {
                    if current == task {
                        self.states[worker] = WorkerState::Idle;
                    }
                }
                if self.failure.is_some() || self.states[worker] == WorkerState::Cancelling {
                    tracing::debug!(worker, %task, "Result discarded after cancellation");
                    return;
                }
                if !self.completed.insert(task) {
                    self.report.duplicates += 1;
                    tracing::debug!(worker, %task, "Duplicate result dropped");
                    return;
                }
                if let Err(e) = sink.accept(task, result) {
                    self.fail(pool, None, e.context(format!("Failed to merge result of {}", task)));
                    return;
                }
                if self.all_completed() {
                    self.release_parked(pool);
                }
            }
            Message::Exit => {
                self.states[worker] = WorkerState::Exited;
            }
            Message::Error(err) => {
                if self.states[worker] == WorkerState::Exited {
                    return;
                }
                self.states[worker] = WorkerState::Exited;
                tracing::error!(worker, node = %err.node_id, error = %err.error, "Worker reported error");
                if self.failure.is_none() {
                    let failure = anyhow::anyhow!("Worker {} ({}) failed: {}", worker, err.node_id, err.error);
                    self.fail(pool, Some(worker), failure);
                }
            }
            other => {
                tracing::warn!(worker, message = other.kind(), "Unexpected message during dispatch");
            }
        }
    }

    fn all_completed(&self) -> bool {
        self.completed.len() == self.tasks.len()
    }

    fn next_task(&mut self) -> Option<Task> {
        while let Some(task) = self.retry.pop_front() {
            if !self.completed.contains(&task) {
                return Some(task);
            }
        }
        let task = self.tasks.get(self.next).copied()?;
        self.next += 1;
        Some(task)
    }

    fn send(&mut self, pool: &WorkerPool, worker: WorkerId, message: Message) -> bool {
        if pool.outboxes[worker].send(message).is_err() {
            tracing::warn!(worker, "Worker channel closed");
            self.states[worker] = WorkerState::Exited;
            return false;
        }
        true
    }

    /// Answer a worker asking for work
    fn assign(&mut self, pool: &WorkerPool, worker: WorkerId) {
        if let Some(task) = self.next_task() {
            if self.send(pool, worker, Message::Start(task)) {
                self.report.starts_sent += 1;
                let deadline = self.settings.task_timeout.map(|t| Instant::now() + t);
                self.states[worker] = WorkerState::Dispatched { task, deadline };
            } else {
                self.retry.push_front(task);
            }
        } else if self.settings.task_timeout.is_some() && !self.all_completed() {
            self.states[worker] = WorkerState::Ready;
            self.parked.push_back(worker);
        } else if self.send(pool, worker, Message::Exit) {
            self.report.exits_sent += 1;
            self.states[worker] = WorkerState::Exiting;
        }
    }

    fn release_parked(&mut self, pool: &WorkerPool) {
        while let Some(worker) = self.parked.pop_front() {
            if self.states[worker] == WorkerState::Ready {
                self.assign(pool, worker);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.states
            .iter()
            .filter_map(|s| match s {
                WorkerState::Dispatched { deadline, .. } => *deadline,
                _ => None,
            })
            .min()
    }

    /// Requeue every overdue task and hand requeued work to parked workers
    fn expire_overdue(&mut self, pool: &WorkerPool, now: Instant) {
        for worker in 0..self.states.len() {
            let WorkerState::Dispatched {
                task,
                deadline: Some(deadline),
            } = self.states[worker]
            else {
                continue;
            };
            if deadline > now {
                continue;
            }

            self.states[worker] = WorkerState::Dispatched { task, deadline: None };
            if self.completed.contains(&task) {
                continue;
            }

            let attempts = {
                let entry = self.attempts.entry(task).or_insert(0);
                *entry += 1;
                *entry
            };
            if attempts > self.settings.max_task_retries {
                let failure = anyhow::anyhow!("{} timed out {} times", task, attempts);
                self.fail(pool, None, failure);
                return;
            }

            tracing::warn!(worker, %task, attempt = attempts, "Task timed out, requeued");
            self.report.redispatched += 1;
            self.retry.push_back(task);
            self.cancel_overdue(pool, worker);
        }

        while !self.retry.is_empty() {
            let Some(worker) = self.parked.pop_front() else {
                break;
            };
            if self.states[worker] == WorkerState::Ready {
                self.assign(pool, worker);
            }
        }
    }

    /// Cancel a worker whose task was requeued, unless no other worker is live
    ///
    /// The last live worker keeps its task so requeued work can still run.
    fn cancel_overdue(&mut self, pool: &WorkerPool, worker: WorkerId) {
        let others_live = self
            .states
            .iter()
            .enumerate()
            .any(|(id, state)| id != worker && state.is_live());
        if !others_live {
            return;
        }

        let reason = ErrorMessage::new("coordinator", "task timed out");
        if self.send(pool, worker, Message::Error(reason)) {
            tracing::debug!(worker, "Overdue worker cancelled");
            self.states[worker] = WorkerState::Cancelling;
        }
    }

    /// Record the failure and cancel every other live worker
    fn fail(&mut self, pool: &WorkerPool, reporter: Option<WorkerId>, failure: anyhow::Error) {
        if self.failure.is_some() {
            return;
        }
        self.failure = Some(failure);
        self.parked.clear();

        let reason = ErrorMessage::new("coordinator", "run cancelled");
        for worker in 0..self.states.len() {
            if Some(worker) == reporter || !self.states[worker].is_live() {
                continue;
            }
            if self.send(pool, worker, Message::Error(reason.clone())) {
                self.states[worker] = WorkerState::Cancelling;
            }
        }
    }
}
