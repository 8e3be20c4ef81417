//! templink entry point: keep the configured templates rendered and print
//! every change until Ctrl-C.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use templink_cache::{Connection, ConnectionEvent, Registry, TemplateCache};
use templink_client::config::ClientConfig;
use templink_client::device::DeviceIdStore;
use templink_client::error::ClientError;
use templink_client::realtime::{spawn_session_manager, SessionSettings};
use templink_client::telemetry::{init_tracing, TelemetryConfig};
use templink_client::ws::WsConnection;
use templink_core::{is_template, AmbientContext, TemplateValue};

const PUSH_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 16;

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    init_tracing(&TelemetryConfig::default())?;
    let config = ClientConfig::load()?;

    let device_id =
        DeviceIdStore::new(&config.device.path).resolve(config.device.id_override.as_deref())?;
    let context = AmbientContext::new(&config.user, device_id)
        .with_view(&config.view)
        .with_locale(&config.locale);

    let connection = Arc::new(WsConnection::new());
    let cache = TemplateCache::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Registry::shared(),
        context,
    );

    let (push_tx, push_rx) = mpsc::channel(PUSH_BUFFER);
    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let dispatcher = tokio::spawn(cache.dispatcher().run(push_rx));
    let manager = spawn_session_manager(
        connection,
        SessionSettings::from_config(&config),
        push_tx,
        event_tx,
    );

    // Subscribing before the first session would only deliver failures.
    let connected = tokio::select! {
        connected = wait_for_session(&cache, &mut event_rx) => connected,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            false
        }
    };
    if !connected {
        manager.abort();
        dispatcher.abort();
        return Ok(());
    }

    let mut subscriptions = Vec::with_capacity(config.watches.len());
    for watch in &config.watches {
        if !is_template(&watch.template) {
            println!("{}: {}", watch.name, watch.template);
            continue;
        }
        let name = watch.name.clone();
        let subscription = cache
            .subscribe(&watch.template, watch.variables()?, move |value| {
                print_value(&name, value)
            })
            .await;
        subscriptions.push(subscription);
    }
    info!(watches = subscriptions.len(), "Watching templates");

    let events = tokio::spawn(cache.clone().run_events(event_rx));
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    for subscription in &subscriptions {
        subscription.unsubscribe().await;
    }
    manager.abort();
    events.abort();
    dispatcher.abort();
    Ok(())
}

/// Apply events until the first session is up. False if the manager stopped.
async fn wait_for_session(
    cache: &TemplateCache,
    events: &mut mpsc::Receiver<ConnectionEvent>,
) -> bool {
    while let Some(event) = events.recv().await {
        let connected = event == ConnectionEvent::Connected;
        cache.handle_event(event).await;
        if connected {
            return true;
        }
    }
    false
}

fn print_value(name: &str, value: &TemplateValue) {
    match value {
        TemplateValue::Pending => {}
        TemplateValue::Rendered(text) => println!("{name}: {text}"),
        TemplateValue::Failed(err) => println!("{name}: [error] {err}"),
    }
}
