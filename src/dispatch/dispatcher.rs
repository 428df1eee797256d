//! Delivery of one publication to its matching subscriptions.

use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::errors::ErrorHandler;
use crate::subscriptions::SubscriptionManager;
use crate::types::{AnyMessage, Class, DeadMessage};

/// Looks up and invokes handlers for published messages.
///
/// Used directly by synchronous publication and by worker threads for
/// asynchronous publication.
pub struct Dispatcher {
    subscriptions: Arc<SubscriptionManager>,
    errors: Arc<dyn ErrorHandler>,
    /// Asynchronous publications accepted but not yet fully dispatched.
    pending: AtomicUsize,
}

impl Dispatcher {
    pub fn new(subscriptions: Arc<SubscriptionManager>, errors: Arc<dyn ErrorHandler>) -> Self {
        Self {
            subscriptions,
            errors,
            pending: AtomicUsize::new(0),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn error_handler(&self) -> &Arc<dyn ErrorHandler> {
        &self.errors
    }

    /// Deliver `args` on the calling thread.
    ///
    /// Handlers run in subscription registration order. If no listener
    /// received the message it is wrapped in a [`DeadMessage`] and delivered
    /// again. Returns true if at least one listener received the original.
    pub fn dispatch(&self, args: &[AnyMessage]) -> bool {
        if args.is_empty() {
            return false;
        }

        let classes: Vec<Class> = args.iter().map(AnyMessage::class).collect();
        let matches = self.subscriptions.resolve(&classes);

        let mut delivered = false;
        for matched in matches.iter() {
            delivered |= matched.publish(args, self.errors.as_ref());
        }

        if !delivered {
            self.dispatch_dead(args);
        }
        delivered
    }

    fn dispatch_dead(&self, args: &[AnyMessage]) {
        if args.len() == 1 && args[0].is::<DeadMessage>() {
            trace!("Dead message has no listener; dropping");
            return;
        }

        debug!(
            arguments = args.len(),
            first = %args[0].class(),
            "No listener received message; publishing dead message"
        );

        let dead = AnyMessage::new(DeadMessage::new(args.to_vec()));
        let matches = self.subscriptions.resolve(&[dead.class()]);
        for matched in matches.iter() {
            matched.publish(slice::from_ref(&dead), self.errors.as_ref());
        }
    }

    // --- Pending accounting for asynchronous publication ---

    pub(crate) fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// True while asynchronous publications are queued or being dispatched.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }
}
