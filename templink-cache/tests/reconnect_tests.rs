use templink_cache::{ConnectionEvent, Push};
use templink_core::{CacheError, TemplateValue, Variables};
use templink_test_utils::fixtures::{cache_with_mock, LIGHT_TEMPLATE};
use templink_test_utils::Recorder;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_reconnect_reissues_every_entry_and_keeps_values() {
    let (cache, connection) = cache_with_mock();
    let light = Recorder::new();
    cache
        .subscribe(LIGHT_TEMPLATE, Variables::new(), light.callback())
        .await;
    cache.subscribe("{{ now() }}", Variables::new(), |_| {}).await;
    let correlation = connection.correlation_for(LIGHT_TEMPLATE).unwrap();
    cache.dispatcher().dispatch(Push::rendered(correlation, "on"));

    assert_eq!(cache.on_disconnect(), 2);
    assert!(cache.snapshot().iter().all(|entry| !entry.live));

    assert_eq!(cache.on_reconnect().await, 2);

    let calls = connection.subscribe_calls();
    assert_eq!(calls.len(), 4);
    let mut original: Vec<_> = calls[..2].iter().map(|c| c.request.template.clone()).collect();
    let mut reissued: Vec<_> = calls[2..].iter().map(|c| c.request.template.clone()).collect();
    original.sort();
    reissued.sort();
    assert_eq!(original, reissued);
    assert!(cache.snapshot().iter().all(|entry| entry.live));

    // Stale-but-available: nothing re-delivered until a fresh push.
    assert_eq!(
        light.values(),
        vec![TemplateValue::Pending, TemplateValue::rendered("on")]
    );
    // Re-issued requests keep the entry's correlation id.
    assert_eq!(connection.correlation_for(LIGHT_TEMPLATE), Some(correlation));

    cache.dispatcher().dispatch(Push::rendered(correlation, "off"));
    assert_eq!(light.rendered(), vec!["on", "off"]);
}

#[tokio::test]
async fn test_detached_entry_is_removed_without_backend_call() {
    let (cache, connection) = cache_with_mock();
    let sub = cache.subscribe(LIGHT_TEMPLATE, Variables::new(), |_| {}).await;

    cache.on_disconnect();
    sub.unsubscribe().await;

    assert!(cache.snapshot().is_empty());
    assert_eq!(connection.unsubscribe_count(), 0);
    assert_eq!(cache.on_reconnect().await, 0);
}

#[tokio::test]
async fn test_failed_reissue_keeps_last_value() {
    let (cache, connection) = cache_with_mock();
    let recorder = Recorder::new();
    let sub = cache
        .subscribe(LIGHT_TEMPLATE, Variables::new(), recorder.callback())
        .await;
    let correlation = connection.correlation_for(LIGHT_TEMPLATE).unwrap();
    cache.dispatcher().dispatch(Push::rendered(correlation, "on"));
    cache.on_disconnect();

    connection.set_offline(true);
    assert_eq!(cache.on_reconnect().await, 1);

    assert_eq!(recorder.count(), 2);
    let entry = cache.entry(sub.key()).unwrap();
    assert_eq!(entry.value, TemplateValue::rendered("on"));
    assert!(!entry.live);

    // The next successful session picks it up again.
    connection.set_offline(false);
    cache.on_reconnect().await;
    assert!(cache.entry(sub.key()).unwrap().live);
}

#[tokio::test]
async fn test_reissue_rejected_as_malformed_is_delivered() {
    let (cache, connection) = cache_with_mock();
    let recorder = Recorder::new();
    cache
        .subscribe(LIGHT_TEMPLATE, Variables::new(), recorder.callback())
        .await;

    connection.fail_next_subscribe(CacheError::malformed_template("entity gone"));
    cache.on_reconnect().await;

    assert!(matches!(
        recorder.last().and_then(|v| v.failure().cloned()),
        Some(CacheError::MalformedTemplate { .. })
    ));
}

#[tokio::test]
async fn test_offline_entry_recovers_on_connect() {
    let (cache, connection) = cache_with_mock();
    connection.set_offline(true);
    let recorder = Recorder::new();
    let sub = cache
        .subscribe(LIGHT_TEMPLATE, Variables::new(), recorder.callback())
        .await;
    assert!(recorder.last().unwrap().is_failure());

    connection.set_offline(false);
    cache.handle_event(ConnectionEvent::Connected).await;

    assert!(cache.entry(sub.key()).unwrap().live);
    let correlation = connection.correlation_for(LIGHT_TEMPLATE).unwrap();
    cache.dispatcher().dispatch(Push::rendered(correlation, "on"));
    assert_eq!(recorder.last(), Some(TemplateValue::rendered("on")));
}

#[tokio::test]
async fn test_event_loop_applies_lifecycle_events() {
    let (cache, connection) = cache_with_mock();
    let sub = cache.subscribe(LIGHT_TEMPLATE, Variables::new(), |_| {}).await;

    let (tx, rx) = mpsc::channel(4);
    tx.send(ConnectionEvent::Disconnected {
        reason: "server restart".to_string(),
    })
    .await
    .unwrap();
    tx.send(ConnectionEvent::Connected).await.unwrap();
    drop(tx);

    cache.clone().run_events(rx).await;

    assert_eq!(connection.subscribe_count(), 2);
    assert!(cache.entry(sub.key()).unwrap().live);
}
