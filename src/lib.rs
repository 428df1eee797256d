//! # Message Bus
//!
//! An in-process publish/subscribe bus that routes messages by their runtime
//! type.
//!
//! ## Core Concepts
//!
//! - **Listeners**: Types that declare handlers for the message types they accept
//! - **Subscriptions**: One per handler, shared by every instance of a listener type
//! - **Dispatch**: Exact matches plus handlers for supertypes and varargs
//! - **Transfer queue**: Bounded lock-free queue feeding the asynchronous workers
//!
//! ## Example
//!
//! ```ignore
//! use messagebus::{Handler, Listener, MessageBus};
//!
//! struct Greeter;
//!
//! impl Listener for Greeter {
//!     fn handlers() -> Vec<Handler<Self>> {
//!         vec![Handler::on::<String>("greet", |_, name| println!("hello {}", name))]
//!     }
//! }
//!
//! let bus = MessageBus::new()?;
//! let greeter = Arc::new(Greeter);
//! bus.subscribe(&greeter);
//!
//! // On the calling thread
//! bus.publish(String::from("world"));
//!
//! // On a worker thread
//! bus.publish_async(String::from("async world"))?;
//!
//! bus.shutdown();
//! ```

pub mod bus;
pub mod collections;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use bus::{default_worker_threads, BusConfig, MessageBus};
pub use collections::{ClassTree, ConcurrentSet};
pub use dispatch::{
    Dispatcher, ErrorHandler, Handoff, HandlerError, HandlerResult, LoggingErrorHandler,
    PublicationError, WorkerPool, WorkerPoolConfig,
};
pub use error::{BusError, Result};
pub use queue::{PutError, TakeError, TransferQueue, MAX_CAPACITY};
pub use subscriptions::{
    Handler, Listener, ListenerRef, Match, Subscription, SubscriptionId, SubscriptionManager,
    TypeHierarchy,
};
pub use types::*;
