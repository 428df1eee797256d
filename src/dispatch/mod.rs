//! Handler invocation, failure reporting and the dispatch worker pool.

mod dispatcher;
mod errors;
mod workers;

pub use dispatcher::Dispatcher;
pub use errors::{ErrorHandler, HandlerError, HandlerResult, LoggingErrorHandler, PublicationError};
pub use workers::{Handoff, WorkerPool, WorkerPoolConfig};
