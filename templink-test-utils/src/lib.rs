//! templink Test Utilities
//!
//! Shared test infrastructure for the templink workspace:
//! - A scripted mock connection whose backend calls can be held open
//! - Recording callbacks
//! - Proptest generators for templates and variable bags
//! - Fixtures for common scenarios

pub use templink_cache::{Connection, Push, Registry, Subscription, TemplateCache};
pub use templink_core::{
    AmbientContext, BackendHandle, CacheError, CacheKey, CacheResult, CorrelationId,
    RenderRequest, TemplateValue, Variables,
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

// ============================================================================
// MOCK CONNECTION
// ============================================================================

/// A subscribe call as the mock saw it.
#[derive(Debug, Clone)]
pub struct SubscribeCall {
    pub correlation: CorrelationId,
    pub request: RenderRequest,
}

/// Holds one backend call open until released.
#[derive(Debug)]
pub struct Gate {
    tx: oneshot::Sender<Option<CacheError>>,
}

impl Gate {
    /// Let the held call complete normally.
    pub fn release(self) {
        let _ = self.tx.send(None);
    }

    /// Let the held call complete with `err`.
    pub fn fail(self, err: CacheError) {
        let _ = self.tx.send(Some(err));
    }
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    subscribes: Vec<SubscribeCall>,
    unsubscribes: Vec<BackendHandle>,
    offline: bool,
    subscribe_failures: VecDeque<CacheError>,
    subscribe_gates: VecDeque<oneshot::Receiver<Option<CacheError>>>,
    unsubscribe_gates: VecDeque<oneshot::Receiver<Option<CacheError>>>,
}

/// In-memory backend connection.
///
/// Every call is recorded on entry, before any gate is awaited, so a test
/// can observe a call that is still in flight. Handles are allocated from 1.
#[derive(Default)]
pub struct MockConnection {
    state: Mutex<MockState>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every call with `ConnectionUnavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// The next subscribe fails with `err` (queued, one per call).
    pub fn fail_next_subscribe(&self, err: CacheError) {
        self.state().subscribe_failures.push_back(err);
    }

    /// The next subscribe stays in flight until the returned gate is released.
    pub fn hold_next_subscribe(&self) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.state().subscribe_gates.push_back(rx);
        Gate { tx }
    }

    /// The next unsubscribe stays in flight until the returned gate is released.
    pub fn hold_next_unsubscribe(&self) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.state().unsubscribe_gates.push_back(rx);
        Gate { tx }
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        self.state().subscribes.clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.state().subscribes.len()
    }

    pub fn unsubscribe_calls(&self) -> Vec<BackendHandle> {
        self.state().unsubscribes.clone()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state().unsubscribes.len()
    }

    /// Correlation id of the most recent subscribe for `template`.
    pub fn correlation_for(&self, template: &str) -> Option<CorrelationId> {
        self.state()
            .subscribes
            .iter()
            .rev()
            .find(|call| call.request.template == template)
            .map(|call| call.correlation)
    }
}

async fn pass_gate(gate: Option<oneshot::Receiver<Option<CacheError>>>) -> CacheResult<()> {
    match gate {
        Some(rx) => match rx.await {
            Ok(Some(err)) => Err(err),
            Ok(None) | Err(_) => Ok(()),
        },
        None => Ok(()),
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn subscribe(
        &self,
        correlation: CorrelationId,
        request: &RenderRequest,
    ) -> CacheResult<BackendHandle> {
        let (gate, outcome) = {
            let mut state = self.state();
            state.subscribes.push(SubscribeCall {
                correlation,
                request: request.clone(),
            });
            let gate = state.subscribe_gates.pop_front();
            let outcome = if state.offline {
                Err(CacheError::connection_unavailable("mock connection offline"))
            } else if let Some(err) = state.subscribe_failures.pop_front() {
                Err(err)
            } else {
                state.next_handle += 1;
                Ok(BackendHandle::new(state.next_handle))
            };
            (gate, outcome)
        };
        pass_gate(gate).await?;
        outcome
    }

    async fn unsubscribe(&self, handle: BackendHandle) -> CacheResult<()> {
        let (gate, offline) = {
            let mut state = self.state();
            state.unsubscribes.push(handle);
            (state.unsubscribe_gates.pop_front(), state.offline)
        };
        pass_gate(gate).await?;
        if offline {
            Err(CacheError::connection_unavailable("mock connection offline"))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// RECORDING CALLBACKS
// ============================================================================

/// Collects every value a callback receives.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    values: Arc<Mutex<Vec<TemplateValue>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback appending to this recorder.
    pub fn callback(&self) -> impl Fn(&TemplateValue) + Send + Sync + 'static {
        let values = Arc::clone(&self.values);
        move |value: &TemplateValue| {
            values
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(value.clone());
        }
    }

    pub fn values(&self) -> Vec<TemplateValue> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<TemplateValue> {
        self.values().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.values().len()
    }

    /// Only the rendered strings, in arrival order.
    pub fn rendered(&self) -> Vec<String> {
        self.values()
            .iter()
            .filter_map(|value| value.as_rendered().map(str::to_string))
            .collect()
    }
}

/// Yield to the scheduler until `condition` holds. Panics if it never does.
pub async fn settle_until(mut condition: impl FnMut() -> bool) {
    const ROUNDS: usize = 1_000;
    for _ in 0..ROUNDS {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached after {ROUNDS} scheduler yields");
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for templink inputs.

    use proptest::prelude::*;
    use serde_json::Value;

    use super::Variables;

    /// Scalar JSON values that show up as template variables.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::from(n)),
            "[a-z._]{0,12}".prop_map(Value::String),
            Just(Value::Null),
        ]
    }

    /// Variable bags with up to six entries and one level of nesting.
    pub fn arb_variables() -> impl Strategy<Value = Variables> {
        let leaf = arb_scalar();
        let nested = prop::collection::vec(arb_scalar(), 0..4).prop_map(Value::Array);
        prop::collection::btree_map("[a-z_]{1,8}", prop_oneof![leaf, nested], 0..6)
            .prop_map(|map| map.into_iter().collect())
    }

    /// Small Jinja-style templates.
    pub fn arb_template() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z_]{1,10}".prop_map(|name| format!("{{{{ {name} }}}}")),
            "[a-z_]{1,10}\\.[a-z_]{1,10}"
                .prop_map(|entity| format!("{{{{ states('{entity}') }}}}")),
            "[a-z_]{1,10}".prop_map(|name| format!("{{% if {name} %}}on{{% endif %}}")),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    pub const LIGHT_TEMPLATE: &str = "{{ states('light.x') }}";

    pub fn test_context() -> AmbientContext {
        AmbientContext::new("alice", "0a1b2c3d-4e5f6a7b")
            .with_view("kitchen")
            .with_locale("en-GB")
    }

    /// A cache over a fresh registry and mock connection.
    pub fn cache_with_mock() -> (TemplateCache, Arc<MockConnection>) {
        let connection = MockConnection::shared();
        let cache = TemplateCache::new(
            Arc::clone(&connection) as Arc<dyn Connection>,
            Registry::shared(),
            test_context(),
        );
        (cache, connection)
    }
}
