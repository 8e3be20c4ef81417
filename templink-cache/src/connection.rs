//! The seam between the cache and whatever carries requests to the backend.

use async_trait::async_trait;
use templink_core::{BackendHandle, CacheResult, CorrelationId, RenderRequest};

/// Streaming connection to the template rendering backend.
///
/// Implementations must be thread-safe. Both calls are suspension points:
/// the cache releases all of its state before awaiting them and re-reads
/// that state when they resolve.
///
/// # Push routing
///
/// `subscribe` receives the entry's [`CorrelationId`] before the request is
/// sent. Every result the backend pushes for that subscription must be
/// tagged with it (see [`Push`]) and handed to the
/// [`Dispatcher`](crate::Dispatcher). Because the id is known up front, a
/// push that races ahead of the acknowledgment is still routed.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Start a backend subscription and resolve once the backend has
    /// acknowledged it.
    ///
    /// Fails with `ConnectionUnavailable` when there is no live channel and
    /// with `MalformedTemplate` when the backend rejects the template.
    async fn subscribe(
        &self,
        correlation: CorrelationId,
        request: &RenderRequest,
    ) -> CacheResult<BackendHandle>;

    /// Terminate a backend subscription and resolve on acknowledgment.
    async fn unsubscribe(&self, handle: BackendHandle) -> CacheResult<()>;
}

/// Body of one pushed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushPayload {
    /// A freshly rendered result.
    Rendered(String),
    /// The template failed while rendering (bad entity, type error...).
    RenderError(String),
}

/// An inbound message for one backend subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub correlation: CorrelationId,
    pub payload: PushPayload,
}

impl Push {
    pub fn rendered(correlation: CorrelationId, result: impl Into<String>) -> Self {
        Self {
            correlation,
            payload: PushPayload::Rendered(result.into()),
        }
    }

    pub fn render_error(correlation: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            correlation,
            payload: PushPayload::RenderError(message.into()),
        }
    }
}

/// Connection lifecycle as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A session was (re-)established and authenticated.
    Connected,
    /// The session dropped; the backend forgot every subscription with it.
    Disconnected { reason: String },
}
