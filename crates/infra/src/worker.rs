//! Inbound worker: feeds a subscription into a pipeline segment.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use sagaflow_machine::{ConsumeContext, Message, Subscription};

use crate::dispatcher::{DispatchOutcome, PipelineSegment};

/// Counters shared between a worker thread and its handle.
#[derive(Debug, Default)]
struct WorkerCounters {
    dispatched: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub dispatched: u64,
    pub not_found: u64,
    pub failed: u64,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    counters: Arc<WorkerCounters>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            not_found: self.counters.not_found.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }
}

/// Saga worker loop.
///
/// - Receives deliveries from a subscription
/// - Runs each through the pipeline segment (wrap it with `with_retry` for conflicts)
/// - Logs failures and keeps going; failures never stop the loop
/// - Stops on shutdown or when the subscription disconnects
#[derive(Debug)]
pub struct SagaWorker;

impl SagaWorker {
    pub fn spawn<T>(
        name: impl Into<String>,
        subscription: Subscription<ConsumeContext<T>>,
        segment: PipelineSegment<T>,
    ) -> io::Result<WorkerHandle>
    where
        T: Message,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let counters = Arc::new(WorkerCounters::default());

        let join = {
            let name = name.clone();
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&name, subscription, shutdown_rx, &segment, &counters))?
        };

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            counters,
        })
    }
}

fn worker_loop<T: Message>(
    name: &str,
    subscription: Subscription<ConsumeContext<T>>,
    shutdown_rx: mpsc::Receiver<()>,
    segment: &PipelineSegment<T>,
    counters: &WorkerCounters,
) {
    let tick = Duration::from_millis(50);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(tick) {
            Ok(ctx) => match segment.handle(&ctx) {
                Ok(DispatchOutcome::NotFound) => {
                    counters.not_found.fetch_add(1, Ordering::Relaxed);
                }
                Ok(DispatchOutcome::Applied { .. }) => {
                    counters.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        worker = name,
                        event = %segment.event(),
                        message_id = %ctx.message_id(),
                        error = %err,
                        "saga worker dispatch failed"
                    );
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = name, "saga worker stopped");
}
