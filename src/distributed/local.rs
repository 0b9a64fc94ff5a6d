//! In-process worker pool
//!
//! Each worker is an OS thread running [`Worker::run`] against a shared
//! executor. The coordinator talks to the threads over the same channels a
//! remote pool uses, so both deployments share one dispatch loop.

use crate::distributed::coordinator::WorkerPool;
use crate::worker::{TaskExecutor, Worker, WorkerLink};
use crate::Result;
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Spawn `count` worker threads with ids `0..count`
pub fn spawn_local_workers<E>(count: usize, executor: Arc<E>) -> Result<WorkerPool>
where
    E: TaskExecutor + 'static,
{
    let (outbox, inbox) = mpsc::unbounded_channel();
    let mut outboxes = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);

    for id in 0..count {
        let (to_worker, worker_inbox) = mpsc::unbounded_channel();
        outboxes.push(to_worker);

        let link = WorkerLink {
            id,
            inbox: worker_inbox,
            outbox: outbox.clone(),
        };
        let worker = Worker::new(link, executor.clone(), format!("local-{}", id));
        let handle = std::thread::Builder::new()
            .name(format!("aidgrid-worker-{}", id))
            .spawn(move || {
                let outcome = worker.run()?;
                tracing::trace!(worker = id, tasks = outcome.tasks(), "Worker thread finished");
                Ok(())
            })
            .with_context(|| format!("Failed to spawn worker thread {}", id))?;
        handles.push(handle);
    }

    let mut pool = WorkerPool::new(inbox, outboxes);
    for handle in handles {
        pool.add_thread(handle);
    }
    Ok(pool)
}
