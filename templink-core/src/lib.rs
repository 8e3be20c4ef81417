//! templink Core - Shared Types
//!
//! Pure data structures shared by the cache, the websocket client and the
//! test utilities. This crate contains no I/O and no async code.
//!
//! - [`CacheKey`]: canonical identity of a (template, variables) pair
//! - [`TemplateValue`]: what consumers receive (pending, rendered or failed)
//! - [`AmbientContext`]: caller/device/view fields merged into every request
//! - [`CacheError`]: the failure taxonomy carried through the callback channel

pub mod context;
pub mod error;
pub mod identity;
pub mod key;
pub mod value;

pub use context::{AmbientContext, RenderRequest, Variables};
pub use error::{CacheError, CacheResult};
pub use identity::{BackendHandle, CorrelationId, SubscriberId};
pub use key::{build_key, is_template, CacheKey};
pub use value::TemplateValue;
