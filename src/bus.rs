//! The message bus: subscription, synchronous and asynchronous publication.

use std::fmt;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::dispatch::{
    Dispatcher, ErrorHandler, Handoff, LoggingErrorHandler, WorkerPool, WorkerPoolConfig,
};
use crate::error::{BusError, Result};
use crate::queue::MAX_CAPACITY;
use crate::subscriptions::{Listener, SubscriptionManager};
use crate::types::{AnyMessage, DispatchMode, Message, ReferenceMode};

/// Half the available CPUs, never fewer than one.
pub fn default_worker_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).max(1)
}

/// Configuration for a [`MessageBus`].
#[derive(Clone)]
pub struct BusConfig {
    /// Number of dispatch worker threads.
    /// Default: half the available CPUs, at least one
    pub worker_threads: usize,

    /// Capacity of the publication queue, rounded up to a power of two.
    /// Default: 1024
    pub queue_capacity: usize,

    /// Which subscriptions receive a message.
    pub dispatch_mode: DispatchMode,

    /// How subscriptions hold listeners, unless a listener type pins its own.
    pub subscription_mode: ReferenceMode,

    /// How asynchronous publications are handed to workers.
    pub handoff: Handoff,

    /// Worker threads are named `<prefix>-<n>`.
    pub thread_name_prefix: String,

    /// Receives handler failures.
    pub error_handler: Arc<dyn ErrorHandler>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            queue_capacity: 1024,
            dispatch_mode: DispatchMode::default(),
            subscription_mode: ReferenceMode::default(),
            handoff: Handoff::default(),
            thread_name_prefix: "messagebus".to_string(),
            error_handler: Arc::new(LoggingErrorHandler),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(BusError::InvalidConfig(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(BusError::InvalidConfig(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.queue_capacity > MAX_CAPACITY {
            return Err(BusError::InvalidConfig(format!(
                "queue_capacity {} exceeds maximum {}",
                self.queue_capacity, MAX_CAPACITY
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfig")
            .field("worker_threads", &self.worker_threads)
            .field("queue_capacity", &self.queue_capacity)
            .field("dispatch_mode", &self.dispatch_mode)
            .field("subscription_mode", &self.subscription_mode)
            .field("handoff", &self.handoff)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .finish_non_exhaustive()
    }
}

/// In-process publish/subscribe bus.
///
/// `publish` runs handlers on the calling thread before returning.
/// `publish_async` queues the message for the worker pool and returns once
/// it is queued (or, with [`Handoff::Transfer`], once a worker took it).
pub struct MessageBus {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    /// Only the bus that created the pool shuts it down.
    owns_pool: bool,
    shut_down: AtomicBool,
}

impl MessageBus {
    /// Started bus with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(BusConfig::default())
    }

    /// Validate `config` and start a bus with it.
    pub fn with_config(config: BusConfig) -> Result<Self> {
        config.validate()?;

        let subscriptions = Arc::new(SubscriptionManager::new(
            config.dispatch_mode,
            config.subscription_mode,
        ));
        let dispatcher = Arc::new(Dispatcher::new(subscriptions, config.error_handler));
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
            threads: config.worker_threads,
            capacity: config.queue_capacity,
            handoff: config.handoff,
            thread_name_prefix: config.thread_name_prefix,
        })?);

        let bus = Self {
            dispatcher,
            pool,
            owns_pool: true,
            shut_down: AtomicBool::new(false),
        };
        bus.start()?;
        Ok(bus)
    }

    /// Start the worker threads. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        self.pool.start()
    }

    /// A bus with its own subscriptions that publishes asynchronously
    /// through this bus's worker pool.
    pub fn clone_with_shared_executor(&self) -> Self {
        let subscriptions = self.dispatcher.subscriptions();
        let subscriptions = Arc::new(SubscriptionManager::new(
            subscriptions.dispatch_mode(),
            subscriptions.reference_mode(),
        ));

        Self {
            dispatcher: Arc::new(Dispatcher::new(
                subscriptions,
                Arc::clone(self.dispatcher.error_handler()),
            )),
            pool: Arc::clone(&self.pool),
            owns_pool: false,
            shut_down: AtomicBool::new(false),
        }
    }

    // --- Subscriptions ---

    pub fn subscribe<L: Listener>(&self, listener: &Arc<L>) {
        self.dispatcher.subscriptions().subscribe(listener);
    }

    pub fn unsubscribe<L: Listener>(&self, listener: &Arc<L>) {
        self.dispatcher.subscriptions().unsubscribe(listener);
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        self.dispatcher.subscriptions()
    }

    // --- Publication ---

    /// Deliver `message` on the calling thread.
    pub fn publish<M: Message>(&self, message: M) {
        self.publish_message(AnyMessage::new(message));
    }

    pub fn publish_message(&self, message: AnyMessage) {
        self.dispatcher.dispatch(slice::from_ref(&message));
    }

    /// Deliver several arguments as one publication to multi-argument
    /// handlers.
    pub fn publish_multi(&self, messages: &[AnyMessage]) {
        self.dispatcher.dispatch(messages);
    }

    /// Queue `message` for delivery on a worker thread.
    pub fn publish_async<M: Message>(&self, message: M) -> Result<()> {
        self.publish_message_async(AnyMessage::new(message))
    }

    pub fn publish_message_async(&self, message: AnyMessage) -> Result<()> {
        self.publish_multi_async(vec![message])
    }

    pub fn publish_multi_async(&self, messages: Vec<AnyMessage>) -> Result<()> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        if messages.is_empty() {
            return Ok(());
        }
        self.pool.submit(&self.dispatcher, messages)
    }

    /// True while asynchronous publications from this bus are queued or
    /// being dispatched. Best effort; meant for waiting in tests.
    pub fn has_pending_messages(&self) -> bool {
        self.dispatcher.has_pending()
    }

    // --- Lifecycle ---

    /// Reject further asynchronous publications, let workers drain what is
    /// queued and join them. Buses sharing the executor only stop accepting
    /// work; the pool is stopped by the bus that created it.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owns_pool {
            self.pool.shutdown();
        }
        debug!(owns_pool = self.owns_pool, "Message bus shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscriptions", &self.subscriptions().subscription_count())
            .field("pool", &self.pool.config())
            .field("owns_pool", &self.owns_pool)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
