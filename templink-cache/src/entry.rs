//! One cache record per distinct key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use templink_core::{
    BackendHandle, CacheKey, CorrelationId, RenderRequest, SubscriberId, TemplateValue,
};

/// A consumer callback. Invoked synchronously, never while cache state is
/// locked, so it may call back into the cache.
pub type Callback = Arc<dyn Fn(&TemplateValue) + Send + Sync>;

/// Cache record for one logical backend subscription.
///
/// # Backend state
///
/// - `backend_handle` is present once the backend has acknowledged the
///   current subscribe attempt and absent while it is in flight, after a
///   failure, or after the connection dropped.
/// - `pending_attempt` names the subscribe attempt whose acknowledgment is
///   awaited. Reconnects start a new attempt; acknowledgments for older
///   attempts are stale and never touch the entry.
/// - `teardown_in_flight` is set when the last subscriber leaves and cleared
///   by a subscriber arriving before the unsubscribe is acknowledged.
/// - `version` counts value changes. A joiner compares it after its initial
///   delivery to catch a push that landed in between.
pub struct CacheEntry {
    id: CorrelationId,
    key: CacheKey,
    request: RenderRequest,
    current_value: TemplateValue,
    version: u64,
    updated_at: Option<DateTime<Utc>>,
    subscribers: HashMap<SubscriberId, Callback>,
    backend_handle: Option<BackendHandle>,
    teardown_in_flight: bool,
    attempts: u64,
    pending_attempt: Option<u64>,
}

impl CacheEntry {
    pub(crate) fn new(id: CorrelationId, key: CacheKey, request: RenderRequest) -> Self {
        Self {
            id,
            key,
            request,
            current_value: TemplateValue::Pending,
            version: 0,
            updated_at: None,
            subscribers: HashMap::new(),
            backend_handle: None,
            teardown_in_flight: false,
            attempts: 0,
            pending_attempt: None,
        }
    }

    /// Identity of this entry. A recreated entry for the same key gets a new one.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn request(&self) -> &RenderRequest {
        &self.request
    }

    pub fn current_value(&self) -> &TemplateValue {
        &self.current_value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn has_subscriber(&self, subscriber: SubscriberId) -> bool {
        self.subscribers.contains_key(&subscriber)
    }

    pub fn backend_handle(&self) -> Option<BackendHandle> {
        self.backend_handle
    }

    pub fn is_teardown_in_flight(&self) -> bool {
        self.teardown_in_flight
    }

    pub fn is_subscribe_in_flight(&self) -> bool {
        self.pending_attempt.is_some()
    }

    pub(crate) fn add_subscriber(&mut self, subscriber: SubscriberId, callback: Callback) {
        self.subscribers.insert(subscriber, callback);
    }

    /// Returns false when the subscriber was not registered here.
    pub(crate) fn remove_subscriber(&mut self, subscriber: SubscriberId) -> bool {
        self.subscribers.remove(&subscriber).is_some()
    }

    /// Callbacks to fan a value out to, cloned so the lock can be released first.
    pub(crate) fn callbacks(&self) -> Vec<Callback> {
        self.subscribers.values().cloned().collect()
    }

    pub(crate) fn set_value(&mut self, value: TemplateValue) {
        self.current_value = value;
        self.version += 1;
        self.updated_at = Some(Utc::now());
    }

    pub(crate) fn set_teardown_in_flight(&mut self, in_flight: bool) {
        self.teardown_in_flight = in_flight;
    }

    /// Start a new subscribe attempt, superseding any attempt still in flight.
    pub(crate) fn begin_attempt(&mut self) -> u64 {
        self.attempts += 1;
        self.pending_attempt = Some(self.attempts);
        self.backend_handle = None;
        self.attempts
    }

    /// Accept the acknowledgment of `attempt` if it is the one awaited.
    pub(crate) fn finish_attempt(&mut self, attempt: u64) -> bool {
        if self.pending_attempt == Some(attempt) {
            self.pending_attempt = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_backend_handle(&mut self, handle: BackendHandle) {
        self.backend_handle = Some(handle);
    }

    pub(crate) fn take_backend_handle(&mut self) -> Option<BackendHandle> {
        self.backend_handle.take()
    }

    /// Forget the backend subscription after the connection dropped.
    /// Returns true if there was one.
    pub(crate) fn detach(&mut self) -> bool {
        self.backend_handle.take().is_some()
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            correlation: self.id,
            template: self.request.template.clone(),
            subscribers: self.subscribers.len(),
            value: self.current_value.clone(),
            live: self.backend_handle.is_some(),
            subscribe_in_flight: self.pending_attempt.is_some(),
            teardown_in_flight: self.teardown_in_flight,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("key", &self.key.digest())
            .field("subscribers", &self.subscribers.len())
            .field("current_value", &self.current_value)
            .field("version", &self.version)
            .field("backend_handle", &self.backend_handle)
            .field("teardown_in_flight", &self.teardown_in_flight)
            .field("pending_attempt", &self.pending_attempt)
            .finish()
    }
}

/// Point-in-time view of an entry, for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub key: CacheKey,
    pub correlation: CorrelationId,
    pub template: String,
    pub subscribers: usize,
    pub value: TemplateValue,
    /// A backend subscription is acknowledged and believed alive.
    pub live: bool,
    pub subscribe_in_flight: bool,
    pub teardown_in_flight: bool,
    /// When the value last changed; `None` while still pending.
    pub updated_at: Option<DateTime<Utc>>,
}
