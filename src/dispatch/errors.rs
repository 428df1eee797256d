//! Reporting of handler failures.
//!
//! Handler errors and panics never reach the publisher. They are wrapped in a
//! [`PublicationError`] and passed to the bus's [`ErrorHandler`].

use std::any::Any;
use thiserror::Error;

use crate::types::AnyMessage;

/// Error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A failed delivery of a published message to one listener.
#[derive(Debug, Error)]
#[error("{message} (listener: {listener_type}, handler: {handler})")]
pub struct PublicationError {
    /// Human-readable description.
    pub message: String,

    /// The handler's own error, if it returned one.
    #[source]
    pub cause: Option<HandlerError>,

    /// Type name of the listener whose handler failed.
    pub listener_type: &'static str,

    /// Name of the failing handler.
    pub handler: &'static str,

    /// Arguments as delivered to the handler.
    pub published: Vec<AnyMessage>,
}

impl PublicationError {
    pub fn handler_failed(
        listener_type: &'static str,
        handler: &'static str,
        published: &[AnyMessage],
        cause: HandlerError,
    ) -> Self {
        Self {
            message: format!("handler returned an error: {}", cause),
            cause: Some(cause),
            listener_type,
            handler,
            published: published.to_vec(),
        }
    }

    pub fn handler_panicked(
        listener_type: &'static str,
        handler: &'static str,
        published: &[AnyMessage],
        panic: &(dyn Any + Send),
    ) -> Self {
        Self {
            message: format!("handler panicked: {}", panic_message(panic)),
            cause: None,
            listener_type,
            handler,
            published: published.to_vec(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Receives every handler failure.
///
/// Called on the thread that ran the handler, so implementations must not
/// block for long.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, error: &PublicationError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&PublicationError) + Send + Sync,
{
    fn handle_error(&self, error: &PublicationError) {
        self(error)
    }
}

/// Default error handler: logs failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, error: &PublicationError) {
        tracing::error!(
            listener = error.listener_type,
            handler = error.handler,
            arguments = error.published.len(),
            "Publication failed: {}",
            error.message
        );
    }
}
