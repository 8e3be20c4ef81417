//! Deduplicating, fan-out cache for server-rendered template subscriptions.
//!
//! Many consumers asking for the same `(template, variables)` pair share one
//! backend subscription. The pieces:
//!
//! - [`Registry`]: the explicitly constructed key → entry map, shared by
//!   the facade and the dispatcher.
//! - [`TemplateCache`]: `subscribe` / `unsubscribe`, reference counting and
//!   the teardown race, reconnect handling.
//! - [`Dispatcher`]: routes backend pushes to their entry and fans them out.
//! - [`Connection`]: the transport seam, implemented by the websocket client
//!   and by test mocks.

pub mod connection;
pub mod dispatcher;
pub mod entry;
pub mod facade;
pub mod registry;

pub use connection::{Connection, ConnectionEvent, Push, PushPayload};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use entry::{CacheEntry, Callback, EntrySnapshot};
pub use facade::{Subscription, TemplateCache};
pub use registry::{CacheStats, Registry, SharedRegistry};
