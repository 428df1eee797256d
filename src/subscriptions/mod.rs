//! Listener registration and type-based subscription lookup.
//!
//! A listener type describes its handlers through [`Listener::handlers`].
//! The first time an instance of the type is subscribed, the manager creates
//! one [`Subscription`] per enabled handler; every instance of the type is
//! then added to those subscriptions.
//!
//! # Example
//!
//! ```ignore
//! struct Audit;
//!
//! impl Listener for Audit {
//!     fn handlers() -> Vec<Handler<Self>> {
//!         vec![
//!             Handler::on::<String>("on_text", |_, text| println!("{}", text)),
//!             Handler::new("on_any", vec![Class::object()], |_, args| {
//!                 println!("{:?}", args);
//!                 Ok(())
//!             }),
//!         ]
//!     }
//! }
//!
//! let manager = SubscriptionManager::default();
//! manager.subscribe(&Arc::new(Audit));
//! let subs = manager.subscriptions_for(&[Class::of::<String>()]);
//! assert_eq!(subs.len(), 2);
//! ```

mod hierarchy;
mod manager;
mod types;

pub use hierarchy::TypeHierarchy;
pub use manager::SubscriptionManager;
pub use types::{Handler, Listener, ListenerRef, Match, Subscription, SubscriptionId};
