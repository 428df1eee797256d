//! Fixed pool of dispatch threads draining the transfer queue.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

use super::dispatcher::Dispatcher;
use crate::error::{BusError, Result};
use crate::queue::{TakeError, TransferQueue};
use crate::types::AnyMessage;

/// How asynchronous publications are handed to the workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Handoff {
    /// Buffer in the queue; the publisher only waits when it is full.
    #[default]
    Buffered,
    /// The publisher waits until a worker has taken the publication.
    Transfer,
}

/// A queued asynchronous publication.
pub(crate) struct Publication {
    dispatcher: Arc<Dispatcher>,
    args: Vec<AnyMessage>,
}

/// Settings for a [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// Number of dispatch threads.
    pub threads: usize,

    /// Queue capacity, rounded up to a power of two.
    pub capacity: usize,

    pub handoff: Handoff,

    /// Worker threads are named `<prefix>-<n>`.
    pub thread_name_prefix: String,
}

/// Worker threads plus the queue feeding them.
///
/// Shared by every bus cloned with a shared executor.
pub struct WorkerPool {
    queue: Arc<TransferQueue<Publication>>,
    config: WorkerPoolConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Create the pool and its queue without starting any thread.
    pub fn new(config: WorkerPoolConfig) -> Result<Self> {
        if config.threads == 0 {
            return Err(BusError::InvalidConfig(
                "worker pool needs at least one thread".into(),
            ));
        }

        Ok(Self {
            queue: Arc::new(TransferQueue::with_capacity(config.capacity)?),
            config,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Spawn the worker threads. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::ShutDown);
        }
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        for n in 0..self.config.threads {
            let queue = Arc::clone(&self.queue);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.config.thread_name_prefix, n))
                .spawn(move || run_worker(&queue));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.queue.close();
                    for handle in workers.drain(..) {
                        let _ = handle.join();
                    }
                    self.stopped.store(true, Ordering::Release);
                    return Err(BusError::ThreadSpawn(e));
                }
            }
        }

        self.started.store(true, Ordering::Release);
        debug!(
            threads = self.config.threads,
            capacity = self.queue.capacity(),
            handoff = ?self.config.handoff,
            "Worker pool started"
        );
        Ok(())
    }

    /// Queue `args` for dispatch through `dispatcher`.
    pub fn submit(&self, dispatcher: &Arc<Dispatcher>, args: Vec<AnyMessage>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BusError::ShutDown);
        }

        dispatcher.begin();
        let publication = Publication {
            dispatcher: Arc::clone(dispatcher),
            args,
        };

        let queued = match self.config.handoff {
            Handoff::Buffered => self.queue.put(publication),
            Handoff::Transfer => self.queue.transfer(publication),
        };

        queued.map_err(|rejected| {
            dispatcher.finish();
            if rejected.is_closed() {
                BusError::Closed
            } else {
                BusError::ShutDown
            }
        })
    }

    /// True if publications are buffered in the queue.
    pub fn has_queued(&self) -> bool {
        self.queue.has_pending_messages()
    }

    /// Stop accepting publications, let the workers drain the queue and
    /// join them.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock();
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.queue.close();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        debug!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(queue: &TransferQueue<Publication>) {
    loop {
        match queue.take() {
            Ok(publication) => {
                let dispatched = catch_unwind(AssertUnwindSafe(|| {
                    publication.dispatcher.dispatch(&publication.args)
                }));
                if dispatched.is_err() {
                    error!("Dispatch panicked outside a handler");
                }
                publication.dispatcher.finish();
            }
            Err(TakeError::Closed) => break,
            Err(TakeError::Timeout) => continue,
        }
    }

    debug!(
        worker = thread::current().name().unwrap_or("unnamed"),
        "Worker exiting"
    );
}
