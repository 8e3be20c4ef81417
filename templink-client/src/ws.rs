//! [`Connection`] over the backend's websocket API.
//!
//! `WsConnection` outlives individual sessions. The session manager
//! ([`crate::realtime`]) attaches an outbound channel once a session is
//! authenticated and detaches it when the session ends; requests made while
//! detached fail with `ConnectionUnavailable`, and requests still awaiting
//! their `result` frame fail the same way when the session drops.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use templink_cache::{Connection, Push};
use templink_core::{BackendHandle, CacheError, CacheResult, CorrelationId, RenderRequest};

use crate::protocol::{ErrorBody, EventOutcome, IncomingFrame, OutgoingFrame};

enum Pending {
    Subscribe(oneshot::Sender<CacheResult<BackendHandle>>),
    Unsubscribe(oneshot::Sender<CacheResult<()>>),
}

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<OutgoingFrame>>,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    /// Subscription id (the id of its `render_template` request) to the
    /// correlation id its pushes are tagged with.
    routes: HashMap<u64, CorrelationId>,
}

impl Link {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn outbound(&self) -> CacheResult<mpsc::UnboundedSender<OutgoingFrame>> {
        self.outbound
            .clone()
            .ok_or_else(|| CacheError::connection_unavailable("not connected"))
    }
}

#[derive(Default)]
pub struct WsConnection {
    link: Mutex<Link>,
}

impl WsConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_attached(&self) -> bool {
        self.link().outbound.is_some()
    }

    /// Number of requests awaiting a `result` frame.
    pub fn pending_requests(&self) -> usize {
        self.link().pending.len()
    }

    /// Route requests through a freshly authenticated session.
    pub fn attach(&self, outbound: mpsc::UnboundedSender<OutgoingFrame>) {
        let mut link = self.link();
        link.outbound = Some(outbound);
        debug!("Websocket session attached");
    }

    /// Forget the session: fail every pending request and drop all routes.
    /// The backend discards subscriptions together with the session.
    pub fn detach(&self, reason: &str) {
        let pending = {
            let mut link = self.link();
            link.outbound = None;
            link.routes.clear();
            std::mem::take(&mut link.pending)
        };
        debug!(reason, failed = pending.len(), "Websocket session detached");
        for (_, request) in pending {
            let err = CacheError::connection_unavailable(format!("connection lost: {reason}"));
            match request {
                Pending::Subscribe(reply) => {
                    let _ = reply.send(Err(err));
                }
                Pending::Unsubscribe(reply) => {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    /// Apply one inbound frame. Returns the push to dispatch, if any.
    pub fn handle_frame(&self, frame: IncomingFrame) -> Option<Push> {
        match frame {
            IncomingFrame::Result { id, success, error } => {
                self.complete(id, success, error);
                None
            }
            IncomingFrame::Event { id, event } => {
                let correlation = self.link().routes.get(&id).copied();
                let Some(correlation) = correlation else {
                    trace!(id, "Event for unknown subscription");
                    return None;
                };
                match event.outcome() {
                    EventOutcome::Rendered(result) => Some(Push::rendered(correlation, result)),
                    EventOutcome::Failed(message) => Some(Push::render_error(correlation, message)),
                    EventOutcome::Warning(message) => {
                        warn!(%correlation, %message, "Template rendered with warning");
                        None
                    }
                }
            }
            other => {
                trace!(frame = ?other, "Ignoring frame outside handshake");
                None
            }
        }
    }

    fn complete(&self, id: u64, success: bool, error: Option<ErrorBody>) {
        let failure = || match &error {
            Some(body) => CacheError::from_backend(&body.code, &body.message),
            None => CacheError::from_backend("unknown_error", "request failed"),
        };

        let request = {
            let mut link = self.link();
            let request = link.pending.remove(&id);
            if !success && matches!(request, Some(Pending::Subscribe(_))) {
                link.routes.remove(&id);
            }
            request
        };

        match request {
            Some(Pending::Subscribe(reply)) => {
                let result = if success {
                    Ok(BackendHandle::new(id))
                } else {
                    Err(failure())
                };
                let _ = reply.send(result);
            }
            Some(Pending::Unsubscribe(reply)) => {
                let _ = reply.send(if success { Ok(()) } else { Err(failure()) });
            }
            None => trace!(id, "Result for unknown request"),
        }
    }
}

fn closed_before_reply() -> CacheError {
    CacheError::connection_unavailable("connection closed before acknowledgment")
}

#[async_trait]
impl Connection for WsConnection {
    async fn subscribe(
        &self,
        correlation: CorrelationId,
        request: &RenderRequest,
    ) -> CacheResult<BackendHandle> {
        let rx = {
            let mut link = self.link();
            let outbound = link.outbound()?;
            let id = link.allocate_id();
            let (tx, rx) = oneshot::channel();
            let frame = OutgoingFrame::RenderTemplate {
                id,
                template: request.template.clone(),
                variables: request.variables.clone(),
            };
            if outbound.send(frame).is_err() {
                return Err(closed_before_reply());
            }
            link.pending.insert(id, Pending::Subscribe(tx));
            link.routes.insert(id, correlation);
            trace!(id, %correlation, "Sent render_template");
            rx
        };
        rx.await.unwrap_or_else(|_| Err(closed_before_reply()))
    }

    async fn unsubscribe(&self, handle: BackendHandle) -> CacheResult<()> {
        let rx = {
            let mut link = self.link();
            link.routes.remove(&handle.get());
            let outbound = link.outbound()?;
            let id = link.allocate_id();
            let (tx, rx) = oneshot::channel();
            let frame = OutgoingFrame::UnsubscribeEvents {
                id,
                subscription: handle.get(),
            };
            if outbound.send(frame).is_err() {
                return Err(closed_before_reply());
            }
            link.pending.insert(id, Pending::Unsubscribe(tx));
            rx
        };
        rx.await.unwrap_or_else(|_| Err(closed_before_reply()))
    }
}
