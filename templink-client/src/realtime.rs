//! Websocket session manager with reconnect backoff.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use templink_cache::{ConnectionEvent, Push};

use crate::config::{ClientConfig, ReconnectConfig};
use crate::error::WsError;
use crate::protocol::{decode_frames, IncomingFrame, OutgoingFrame};
use crate::ws::WsConnection;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: String,
    pub access_token: String,
    pub reconnect: ReconnectConfig,
}

impl SessionSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.ws_endpoint.clone(),
            access_token: config.access_token.clone(),
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Keep a session open for `connection`, reconnecting with backoff.
///
/// Pushes go to `pushes` (read by the dispatcher) and lifecycle changes to
/// `events` (read by the cache). The task stops once `events` is closed.
pub fn spawn_session_manager(
    connection: Arc<WsConnection>,
    settings: SessionSettings,
    pushes: mpsc::Sender<Push>,
    events: mpsc::Sender<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reconnect = settings.reconnect.clone();
        let mut backoff = reconnect.initial_ms;
        loop {
            match connect(&settings.endpoint, &settings.access_token).await {
                Ok(stream) => {
                    info!(endpoint = %settings.endpoint, "Connected");
                    backoff = reconnect.initial_ms;
                    let reason = run_session(&connection, stream, &pushes, &events).await;
                    connection.detach(&reason);
                    if events
                        .send(ConnectionEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    warn!(endpoint = %settings.endpoint, error = %err, "Connect failed");
                }
            }

            if events.is_closed() {
                break;
            }
            let delay = jittered_backoff(backoff, reconnect.jitter_ms);
            debug!(delay_ms = delay, "Reconnecting after delay");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            backoff = next_backoff(backoff, &reconnect);
        }
        debug!("Session manager stopped");
    })
}

/// Open a websocket and complete the auth handshake.
pub async fn connect(endpoint: &str, access_token: &str) -> Result<WsStream, WsError> {
    let (mut stream, _) = tokio_tungstenite::connect_async(endpoint).await?;

    match next_frame(&mut stream).await? {
        IncomingFrame::AuthRequired { .. } => {}
        _ => return Err(WsError::Handshake { expected: "auth_required" }),
    }

    let auth = OutgoingFrame::Auth {
        access_token: access_token.to_string(),
    };
    stream.send(Message::Text(auth.to_text()?)).await?;

    match next_frame(&mut stream).await? {
        IncomingFrame::AuthOk { ha_version } => {
            debug!(version = ?ha_version, "Authenticated");
            Ok(stream)
        }
        IncomingFrame::AuthInvalid { message } => Err(WsError::AuthRejected(
            message.unwrap_or_else(|| "no reason given".to_string()),
        )),
        _ => Err(WsError::Handshake { expected: "auth_ok" }),
    }
}

async fn next_frame(stream: &mut WsStream) -> Result<IncomingFrame, WsError> {
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => {
                return decode_frames(&text)?
                    .into_iter()
                    .next()
                    .ok_or(WsError::Handshake { expected: "a frame" });
            }
            Message::Close(_) => return Err(WsError::Closed),
            _ => {}
        }
    }
    Err(WsError::Closed)
}

/// Pump one authenticated session until it ends. Returns why it ended.
async fn run_session(
    connection: &WsConnection,
    stream: WsStream,
    pushes: &mpsc::Sender<Push>,
    events: &mpsc::Sender<ConnectionEvent>,
) -> String {
    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutgoingFrame>();

    let forward = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame.to_text() {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "Failed to encode frame"),
            }
        }
    });

    connection.attach(outbound_tx);
    if events.send(ConnectionEvent::Connected).await.is_err() {
        forward.abort();
        return "shutting down".to_string();
    }

    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match decode_frames(&text) {
                Ok(frames) => {
                    for frame in frames {
                        if let Some(push) = connection.handle_frame(frame) {
                            if pushes.send(push).await.is_err() {
                                debug!("Push channel closed");
                            }
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Dropping undecodable message"),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|close| format!("closed by server: {}", close.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => break err.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    forward.abort();
    info!(%reason, "Session ended");
    reason
}

pub fn next_backoff(current_ms: u64, reconnect: &ReconnectConfig) -> u64 {
    let next = (current_ms as f64 * reconnect.multiplier) as u64;
    next.min(reconnect.max_ms)
}

pub fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 500,
            max_ms: 4_000,
            multiplier: 2.0,
            jitter_ms: 100,
        }
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let config = reconnect();
        let mut delay = config.initial_ms;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(delay);
            delay = next_backoff(delay, &config);
        }
        assert_eq!(seen, vec![500, 1_000, 2_000, 4_000, 4_000]);
    }

    #[test]
    fn test_jitter_stays_in_window() {
        for _ in 0..50 {
            let delay = jittered_backoff(1_000, 100);
            assert!((1_000..1_100).contains(&delay));
        }
        assert_eq!(jittered_backoff(1_000, 0), 1_000);
    }
}
