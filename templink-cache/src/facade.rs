//! Subscriber facade: the consumer-facing half of the cache.
//!
//! Every backend call is a suspension point. State is read under the
//! registry lock, the lock is released, the call is awaited, and the live
//! state is re-read on resume. Entry identity is re-checked by correlation
//! id so a resumed call never touches an entry that was removed and
//! recreated for the same key in the meantime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use templink_core::{
    AmbientContext, BackendHandle, CacheError, CacheKey, CacheResult, CorrelationId,
    RenderRequest, SubscriberId, TemplateValue, Variables,
};

use crate::connection::{Connection, ConnectionEvent};
use crate::dispatcher::Dispatcher;
use crate::entry::{CacheEntry, Callback, EntrySnapshot};
use crate::registry::{lock, CacheStats, SharedRegistry};

/// Deduplicating, fan-out cache of template subscriptions.
///
/// Cheap to clone; clones share the registry, connection and context.
#[derive(Clone)]
pub struct TemplateCache {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SharedRegistry,
    connection: Arc<dyn Connection>,
    context: RwLock<AmbientContext>,
    next_subscriber: AtomicU64,
}

/// Result of registering a callback.
enum Attach {
    Joined {
        correlation: CorrelationId,
        value: TemplateValue,
        version: u64,
    },
    Created {
        correlation: CorrelationId,
        attempt: u64,
        version: u64,
    },
}

/// What to do once a subscribe attempt resolved.
enum Resume {
    Live,
    Teardown(BackendHandle),
    Deliver(Vec<Callback>, TemplateValue),
    Retained(CacheError),
    Stale(Option<BackendHandle>),
    Dropped,
}

/// Result of removing a callback.
enum Release {
    NotRegistered,
    Kept,
    Deferred,
    Removed,
    Teardown {
        correlation: CorrelationId,
        handle: BackendHandle,
    },
}

impl TemplateCache {
    /// Build a cache over an explicitly constructed registry. The same
    /// registry must back the [`Dispatcher`] reading this connection's pushes.
    pub fn new(
        connection: Arc<dyn Connection>,
        registry: SharedRegistry,
        context: AmbientContext,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                connection,
                context: RwLock::new(context),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// A dispatcher bound to this cache's registry.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.inner.registry))
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.inner.registry
    }

    pub fn context(&self) -> AmbientContext {
        self.inner
            .context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the ambient context. Existing subscriptions keep the key
    /// they were created with; only later subscribes and rebinds see it.
    pub fn set_context(&self, context: AmbientContext) {
        *self
            .inner
            .context
            .write()
            .unwrap_or_else(PoisonError::into_inner) = context;
    }

    /// The key a subscribe with these arguments would use right now.
    pub fn key_for(&self, template: &str, variables: Variables) -> CacheKey {
        self.request_for(template, variables).key()
    }

    fn request_for(&self, template: &str, variables: Variables) -> RenderRequest {
        let merged = self
            .inner
            .context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(variables);
        RenderRequest::new(template, merged)
    }

    fn allocate_subscriber(&self) -> SubscriberId {
        SubscriberId::new(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe `callback` to the rendered value of `template`.
    ///
    /// The callback is invoked before this returns: with the current value
    /// when the key is already cached, otherwise with
    /// [`TemplateValue::Pending`]. A push landing during that invocation is
    /// re-delivered afterwards, so the last value seen is the entry's value.
    /// Later pushes reach it through the dispatcher. Backend failures arrive as [`TemplateValue::Failed`];
    /// nothing is returned to the caller.
    pub async fn subscribe<F>(&self, template: &str, variables: Variables, callback: F) -> Subscription
    where
        F: Fn(&TemplateValue) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let request = self.request_for(template, variables);
        let key = request.key();
        let subscriber = self.allocate_subscriber();
        self.attach(&key, request, subscriber, Arc::clone(&callback))
            .await;
        Subscription {
            cache: self.clone(),
            key,
            subscriber,
            callback,
        }
    }

    /// Remove a subscription. Idempotent.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.release(&subscription.key, subscription.subscriber).await;
    }

    async fn attach(
        &self,
        key: &CacheKey,
        request: RenderRequest,
        subscriber: SubscriberId,
        callback: Callback,
    ) {
        let attach = {
            let mut registry = lock(&self.inner.registry);
            let joined = match registry.get_mut(key) {
                Some(entry) => {
                    entry.add_subscriber(subscriber, Arc::clone(&callback));
                    if entry.is_teardown_in_flight() {
                        entry.set_teardown_in_flight(false);
                        debug!(key = %key.digest(), "Subscriber arrived during teardown, keeping entry");
                    }
                    Some(Attach::Joined {
                        correlation: entry.id(),
                        value: entry.current_value().clone(),
                        version: entry.version(),
                    })
                }
                None => None,
            };
            match joined {
                Some(joined) => {
                    registry.counters_mut().hits += 1;
                    joined
                }
                None => {
                    let correlation = registry.allocate_correlation();
                    let mut entry = CacheEntry::new(correlation, key.clone(), request.clone());
                    entry.add_subscriber(subscriber, Arc::clone(&callback));
                    let attempt = entry.begin_attempt();
                    let version = entry.version();
                    registry.insert(entry);
                    let counters = registry.counters_mut();
                    counters.misses += 1;
                    counters.backend_subscribes += 1;
                    info!(key = %key.digest(), %correlation, "Created cache entry");
                    Attach::Created {
                        correlation,
                        attempt,
                        version,
                    }
                }
            }
        };

        match attach {
            Attach::Joined {
                correlation,
                value,
                version,
            } => {
                self.deliver_initial(key, correlation, subscriber, &callback, value, version);
            }
            Attach::Created {
                correlation,
                attempt,
                version,
            } => {
                self.deliver_initial(
                    key,
                    correlation,
                    subscriber,
                    &callback,
                    TemplateValue::Pending,
                    version,
                );
                let result = self.inner.connection.subscribe(correlation, &request).await;
                self.complete_subscribe(key, correlation, attempt, result)
                    .await;
            }
        }
    }

    /// Hand a new subscriber the value it registered with, then re-deliver
    /// until it has seen the entry's latest version. A push dispatched on
    /// another thread between registration and this call would otherwise
    /// be overwritten by the older initial value.
    fn deliver_initial(
        &self,
        key: &CacheKey,
        correlation: CorrelationId,
        subscriber: SubscriberId,
        callback: &Callback,
        mut value: TemplateValue,
        mut version: u64,
    ) {
        loop {
            callback(&value);
            let registry = lock(&self.inner.registry);
            match registry.get(key) {
                Some(entry)
                    if entry.id() == correlation
                        && entry.has_subscriber(subscriber)
                        && entry.version() != version =>
                {
                    value = entry.current_value().clone();
                    version = entry.version();
                    trace!(key = %key.digest(), %subscriber, version, "Value moved during initial delivery");
                }
                _ => return,
            }
        }
    }

    /// Apply the outcome of subscribe `attempt` to the live entry.
    async fn complete_subscribe(
        &self,
        key: &CacheKey,
        correlation: CorrelationId,
        attempt: u64,
        result: CacheResult<BackendHandle>,
    ) {
        let resume = {
            let mut registry = lock(&self.inner.registry);
            let accepted = registry
                .get_mut(key)
                .map_or(false, |entry| {
                    entry.id() == correlation && entry.finish_attempt(attempt)
                });

            let mut remove = false;
            let resume = match registry.get_mut(key) {
                Some(entry) if accepted => match result {
                    Ok(handle) if entry.has_subscribers() => {
                        entry.set_backend_handle(handle);
                        Resume::Live
                    }
                    Ok(handle) => {
                        entry.set_teardown_in_flight(true);
                        Resume::Teardown(handle)
                    }
                    Err(_) if !entry.has_subscribers() => {
                        remove = true;
                        Resume::Dropped
                    }
                    Err(err) if attempt > 1 && err.is_connection_failure() => {
                        Resume::Retained(err)
                    }
                    Err(err) => {
                        let value = TemplateValue::Failed(err);
                        entry.set_value(value.clone());
                        Resume::Deliver(entry.callbacks(), value)
                    }
                },
                _ => Resume::Stale(result.ok()),
            };
            if remove {
                registry.remove(key);
            }
            resume
        };

        match resume {
            Resume::Live => {
                debug!(key = %key.digest(), %correlation, attempt, "Backend subscription acknowledged");
            }
            Resume::Teardown(handle) => {
                debug!(key = %key.digest(), %correlation, "Entry emptied while subscribing, tearing down");
                self.finish_teardown(key, correlation, handle).await;
            }
            Resume::Deliver(callbacks, value) => {
                if let Some(err) = value.failure() {
                    warn!(key = %key.digest(), %correlation, error = %err, "Backend subscribe failed");
                }
                for callback in &callbacks {
                    callback(&value);
                }
            }
            Resume::Retained(err) => {
                warn!(key = %key.digest(), %correlation, error = %err, "Resubscribe failed, keeping last value");
            }
            Resume::Stale(Some(handle)) => {
                debug!(key = %key.digest(), %correlation, attempt, "Dropping superseded backend subscription");
                if let Err(err) = self.backend_unsubscribe(handle).await {
                    debug!(%handle, error = %err, "Superseded unsubscribe failed");
                }
            }
            Resume::Stale(None) | Resume::Dropped => {}
        }
    }

    async fn release(&self, key: &CacheKey, subscriber: SubscriberId) {
        let release = {
            let mut registry = lock(&self.inner.registry);
            let release = match registry.get_mut(key) {
                None => Release::NotRegistered,
                Some(entry) => {
                    if !entry.remove_subscriber(subscriber) {
                        Release::NotRegistered
                    } else if entry.has_subscribers() {
                        Release::Kept
                    } else if entry.is_subscribe_in_flight() {
                        // Torn down by the acknowledgment path.
                        entry.set_teardown_in_flight(true);
                        Release::Deferred
                    } else {
                        match entry.take_backend_handle() {
                            Some(handle) => {
                                entry.set_teardown_in_flight(true);
                                Release::Teardown {
                                    correlation: entry.id(),
                                    handle,
                                }
                            }
                            None => Release::Removed,
                        }
                    }
                }
            };
            if matches!(release, Release::Removed) {
                registry.remove(key);
            }
            release
        };

        match release {
            Release::NotRegistered => {}
            Release::Kept => {
                debug!(key = %key.digest(), %subscriber, "Subscriber left, entry still shared");
            }
            Release::Deferred => {
                debug!(key = %key.digest(), "Last subscriber left during subscribe, teardown deferred");
            }
            Release::Removed => {
                info!(key = %key.digest(), "Removed detached cache entry");
            }
            Release::Teardown {
                correlation,
                handle,
            } => {
                self.finish_teardown(key, correlation, handle).await;
            }
        }
    }

    /// Unsubscribe on the backend, then remove the entry unless a
    /// subscriber arrived while the call was in flight.
    async fn finish_teardown(&self, key: &CacheKey, correlation: CorrelationId, handle: BackendHandle) {
        if let Err(err) = self.backend_unsubscribe(handle).await {
            warn!(key = %key.digest(), %handle, error = %err, "Backend unsubscribe failed");
        }

        let mut registry = lock(&self.inner.registry);
        let remove = match registry.get_mut(key) {
            Some(entry) if entry.id() == correlation => {
                if !entry.has_subscribers() && entry.is_teardown_in_flight() {
                    true
                } else {
                    entry.set_teardown_in_flight(false);
                    debug!(key = %key.digest(), subscribers = entry.subscriber_count(), "Teardown superseded, entry kept");
                    false
                }
            }
            _ => false,
        };
        if remove {
            registry.remove(key);
            info!(key = %key.digest(), %correlation, "Removed cache entry");
        }
    }

    async fn backend_unsubscribe(&self, handle: BackendHandle) -> CacheResult<()> {
        lock(&self.inner.registry).counters_mut().backend_unsubscribes += 1;
        self.inner.connection.unsubscribe(handle).await
    }

    /// Re-issue the backend subscribe of every entry that still has
    /// subscribers. Values are left untouched until fresh pushes arrive.
    /// Returns the number of subscribes issued.
    pub async fn on_reconnect(&self) -> usize {
        let jobs: Vec<_> = {
            let mut registry = lock(&self.inner.registry);
            let jobs: Vec<_> = registry
                .entries_mut()
                .filter(|entry| entry.has_subscribers())
                .map(|entry| {
                    let attempt = entry.begin_attempt();
                    (entry.key().clone(), entry.id(), attempt, entry.request().clone())
                })
                .collect();
            registry.counters_mut().backend_subscribes += jobs.len() as u64;
            jobs
        };

        let issued = jobs.len();
        info!(entries = issued, "Re-issuing subscriptions after reconnect");
        join_all(
            jobs.into_iter()
                .map(|(key, correlation, attempt, request)| async move {
                    let result = self.inner.connection.subscribe(correlation, &request).await;
                    self.complete_subscribe(&key, correlation, attempt, result)
                        .await;
                }),
        )
        .await;
        issued
    }

    /// Forget every backend subscription. The backend drops them with the
    /// session, so there is nothing to unsubscribe. Returns how many
    /// entries were live.
    pub fn on_disconnect(&self) -> usize {
        let mut registry = lock(&self.inner.registry);
        registry
            .entries_mut()
            .map(|entry| entry.detach())
            .filter(|detached| *detached)
            .count()
    }

    pub async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.on_reconnect().await;
            }
            ConnectionEvent::Disconnected { reason } => {
                let detached = self.on_disconnect();
                info!(%reason, detached, "Connection lost, subscriptions detached");
            }
        }
    }

    /// Consume connection lifecycle events until every sender is gone.
    pub async fn run_events(self, mut events: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("Connection event channel closed");
    }

    pub fn stats(&self) -> CacheStats {
        lock(&self.inner.registry).stats()
    }

    /// Every entry, ordered by key.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let registry = lock(&self.inner.registry);
        let mut entries: Vec<_> = registry.entries().map(CacheEntry::snapshot).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn entry(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        lock(&self.inner.registry).get(key).map(CacheEntry::snapshot)
    }
}

impl fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCache")
            .field("stats", &self.stats())
            .finish()
    }
}

/// One consumer's registration. Dropping it does not unsubscribe; call
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    cache: TemplateCache,
    key: CacheKey,
    subscriber: SubscriberId,
    callback: Callback,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.subscriber
    }

    /// Whether the callback is still registered with an entry.
    pub fn is_active(&self) -> bool {
        lock(self.cache.registry())
            .get(&self.key)
            .map_or(false, |entry| entry.has_subscriber(self.subscriber))
    }

    pub async fn unsubscribe(&self) {
        self.cache.release(&self.key, self.subscriber).await;
    }

    /// Move this callback to a new template or variables.
    ///
    /// The new key is joined before the old one is released, so an entry
    /// shared by both is never torn down in between. Rebinding to the
    /// current key only re-delivers the current value.
    pub async fn rebind(&mut self, template: &str, variables: Variables) {
        let request = self.cache.request_for(template, variables);
        let key = request.key();

        if key == self.key {
            let current = lock(self.cache.registry()).get(&key).and_then(|entry| {
                entry
                    .has_subscriber(self.subscriber)
                    .then(|| (entry.id(), entry.current_value().clone(), entry.version()))
            });
            if let Some((correlation, value, version)) = current {
                self.cache.deliver_initial(
                    &key,
                    correlation,
                    self.subscriber,
                    &self.callback,
                    value,
                    version,
                );
                return;
            }
        }

        let subscriber = self.cache.allocate_subscriber();
        self.cache
            .attach(&key, request, subscriber, Arc::clone(&self.callback))
            .await;
        let (old_key, old_subscriber) = (
            std::mem::replace(&mut self.key, key),
            std::mem::replace(&mut self.subscriber, subscriber),
        );
        self.cache.release(&old_key, old_subscriber).await;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key.digest())
            .field("subscriber", &self.subscriber)
            .finish()
    }
}
