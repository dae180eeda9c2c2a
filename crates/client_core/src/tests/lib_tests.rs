use super::*;
use async_trait::async_trait;
use peripheral::simulated::{FailStage, SimulatedCapability, SimulatedDevice, SimulatedProfile};
use std::time::Duration;
use tokio::{sync::broadcast::error::TryRecvError, time::timeout};

const WAIT: Duration = Duration::from_secs(2);

fn controller_for(profile: SimulatedProfile) -> (Arc<SessionController>, SimulatedDevice) {
    let capability = SimulatedCapability::new(profile);
    let device = capability.device();
    (SessionController::new(Arc::new(capability)), device)
}

async fn next_matching(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn wait_for_state(events: &mut broadcast::Receiver<SessionEvent>, state: ConnectionState) {
    next_matching(events, |event| {
        matches!(event, SessionEvent::ConnectionStateChanged(s) if s.connection == state)
    })
    .await;
}

async fn wait_for_counter(events: &mut broadcast::Receiver<SessionEvent>, value: i64) {
    next_matching(events, |event| *event == SessionEvent::CounterChanged(value)).await;
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return drained,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

fn states(events: &[SessionEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::ConnectionStateChanged(snapshot) => Some(snapshot.connection),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn connect_subscribes_primary_and_battery() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();

    let handle = controller.connect().await.expect("connect");
    assert_eq!(handle.display_name(), "ESP32_Counter");

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert_eq!(snapshot.peripheral, Some(handle));
    assert_eq!(snapshot.counter, 1);
    assert_eq!(snapshot.battery_level, "100");
    assert!(snapshot.battery_available);
    assert_eq!(device.stats().subscribe_calls, 2);

    assert_eq!(
        states(&drain(&mut events)),
        vec![ConnectionState::Scanning, ConnectionState::Connected]
    );
}

#[tokio::test]
async fn short_presses_count_up_and_survive_disconnect() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();
    controller.connect().await.expect("connect");

    for _ in 0..3 {
        assert_eq!(device.notify_primary(b"S").await, 1);
    }
    wait_for_counter(&mut events, 4).await;

    assert!(controller.disconnect().await);
    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert_eq!(snapshot.peripheral, None);
    assert_eq!(snapshot.counter, 4);
    assert!(!device.is_linked().await);
    assert_eq!(device.notify_primary(b"S").await, 0);
}

#[tokio::test]
async fn press_tokens_adjust_counter_and_unknown_ones_are_ignored() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();
    controller.connect().await.expect("connect");

    for token in ["L", "D", "BUTTON_PRESSED", "bogus", " S \n"] {
        device.notify_primary(token).await;
    }

    let mut seen = Vec::new();
    while seen.last() != Some(&4) {
        if let SessionEvent::CounterChanged(value) =
            next_matching(&mut events, |e| matches!(e, SessionEvent::CounterChanged(_))).await
        {
            seen.push(value);
        }
    }
    assert_eq!(seen, vec![0, 2, 3, 4]);
}

#[tokio::test]
async fn battery_notifications_replace_level_and_label() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();
    controller.connect().await.expect("connect");

    assert_eq!(device.notify_battery(b"87\n").await, 1);
    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::BatteryChanged(_))).await;
    assert_eq!(event, SessionEvent::BatteryChanged("87".to_string()));

    let state = controller.counter_state().await;
    assert_eq!(state.display_label(true), "87-0-1");
    assert_eq!(controller.snapshot().await.battery_level, "87");
}

#[tokio::test]
async fn missing_battery_service_still_connects_with_default_level() {
    let (controller, device) = controller_for(SimulatedProfile::counter_only());
    controller.connect().await.expect("connect");

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert!(!snapshot.battery_available);
    assert_eq!(snapshot.battery_level, "100");
    assert_eq!(device.notify_battery(b"42").await, 0);
}

#[tokio::test]
async fn battery_subscribe_failure_is_not_fatal() {
    let (controller, device) = controller_for(
        SimulatedProfile::default().failing_at(FailStage::Subscribe(BATTERY_LEVEL)),
    );
    let mut events = controller.subscribe_events();
    controller.connect().await.expect("connect");

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert!(!snapshot.battery_available);
    assert!(device.is_linked().await);
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, SessionEvent::Error { .. })));
}

#[tokio::test]
async fn counter_only_mode_skips_battery_subscription() {
    let capability = SimulatedCapability::new(SimulatedProfile::default());
    let device = capability.device();
    let controller = SessionController::with_options(
        Arc::new(capability),
        SessionOptions {
            track_battery: false,
            name_prefix: None,
        },
    );
    controller.connect().await.expect("connect");

    assert_eq!(device.stats().subscribe_calls, 1);
    assert!(!controller.snapshot().await.battery_available);
    assert_eq!(device.notify_battery(b"42").await, 0);
}

#[tokio::test]
async fn name_prefix_mismatch_fails_discovery() {
    let capability = SimulatedCapability::new(SimulatedProfile::default());
    let controller = SessionController::with_options(
        Arc::new(capability),
        SessionOptions {
            track_battery: true,
            name_prefix: Some("Nordic".to_string()),
        },
    );
    let err = controller.connect().await.expect_err("no match");
    assert!(matches!(
        err,
        ConnectError::Peripheral(PeripheralError::Discovery(_))
    ));
}

#[tokio::test]
async fn every_failure_stage_returns_to_disconnected_with_error() {
    let profiles = [
        SimulatedProfile::default().failing_at(FailStage::DiscoveryCancelled),
        SimulatedProfile::default().failing_at(FailStage::DiscoveryUnavailable),
        SimulatedProfile::default().failing_at(FailStage::Link),
        SimulatedProfile::default().without_service(PRIMARY_SERVICE),
        SimulatedProfile::default().without_characteristic(PRIMARY_SERVICE, PRIMARY_CHARACTERISTIC),
        SimulatedProfile::default().failing_at(FailStage::Subscribe(PRIMARY_CHARACTERISTIC)),
    ];

    for profile in profiles {
        let label = format!("{:?}", profile.fail_at);
        let (controller, device) = controller_for(profile);
        let mut events = controller.subscribe_events();

        let cause = match controller.connect().await {
            Err(ConnectError::Peripheral(cause)) => cause,
            other => panic!("{label}: expected peripheral error, got {other:?}"),
        };

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.connection, ConnectionState::Disconnected, "{label}");
        assert_eq!(snapshot.peripheral, None, "{label}");
        assert!(!device.is_linked().await, "{label}");

        let emitted = drain(&mut events);
        assert_eq!(
            states(&emitted),
            vec![ConnectionState::Scanning, ConnectionState::Disconnected],
            "{label}"
        );
        assert_eq!(
            emitted.last(),
            Some(&SessionEvent::Error {
                kind: cause.kind(),
                message: cause.to_string(),
            }),
            "{label}"
        );
    }
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (controller, _device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();

    assert!(!controller.disconnect().await);
    assert!(drain(&mut events).is_empty());

    controller.connect().await.expect("connect");
    assert!(controller.disconnect().await);
    drain(&mut events);
    assert!(!controller.disconnect().await);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn spontaneous_link_loss_keeps_counter_and_allows_reconnect() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();
    controller.connect().await.expect("connect");

    device.notify_primary(b"S").await;
    device.notify_battery(b"50").await;
    wait_for_counter(&mut events, 2).await;
    next_matching(&mut events, |e| *e == SessionEvent::BatteryChanged("50".into())).await;

    assert!(device.drop_link().await);
    wait_for_state(&mut events, ConnectionState::Disconnected).await;

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.peripheral, None);
    assert_eq!(snapshot.counter, 2);
    assert_eq!(snapshot.battery_level, "50");

    controller.connect().await.expect("reconnect");
    assert_eq!(device.notify_primary(b"S").await, 1);
    wait_for_counter(&mut events, 3).await;
}

#[tokio::test]
async fn disconnect_during_discovery_supersedes_the_attempt() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();

    device.hold_discovery();
    let pending = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.connect().await }
    });
    device.wait_for_stats(|s| s.discover_calls >= 1).await;

    assert!(controller.disconnect().await);
    let result = timeout(WAIT, pending).await.expect("attempt ends").expect("join");
    assert!(matches!(result, Err(ConnectError::Superseded)));

    let emitted = drain(&mut events);
    assert_eq!(
        states(&emitted),
        vec![ConnectionState::Scanning, ConnectionState::Disconnected]
    );
    assert!(emitted.iter().all(|e| !matches!(e, SessionEvent::Error { .. })));
    assert_eq!(device.stats().connect_calls, 0);
    assert_eq!(controller.snapshot().await.connection, ConnectionState::Disconnected);

    device.release_discovery();
    controller.connect().await.expect("fresh attempt");
    assert_eq!(controller.snapshot().await.connection, ConnectionState::Connected);
}

#[tokio::test]
async fn link_loss_during_subscription_supersedes_the_attempt() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();

    device.hold_subscribe();
    let pending = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.connect().await }
    });
    device.wait_for_stats(|s| s.subscribe_calls >= 1).await;

    assert!(device.drop_link().await);
    wait_for_state(&mut events, ConnectionState::Disconnected).await;
    device.release_subscribe();

    let result = timeout(WAIT, pending).await.expect("attempt ends").expect("join");
    assert!(matches!(result, Err(ConnectError::Superseded)));
    assert!(drain(&mut events)
        .iter()
        .all(|e| !matches!(e, SessionEvent::Error { .. })));

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert_eq!(snapshot.peripheral, None);
}

#[tokio::test]
async fn manual_increment_works_in_every_state() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();

    assert_eq!(controller.manual_increment().await, 2);
    assert_eq!(drain(&mut events), vec![SessionEvent::CounterChanged(2)]);

    device.hold_discovery();
    let pending = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.connect().await }
    });
    device.wait_for_stats(|s| s.discover_calls >= 1).await;
    assert_eq!(controller.manual_increment().await, 3);
    device.release_discovery();
    timeout(WAIT, pending)
        .await
        .expect("attempt ends")
        .expect("join")
        .expect("connect");

    assert_eq!(controller.manual_increment().await, 4);
    assert_eq!(controller.snapshot().await.counter, 4);
}

#[tokio::test]
async fn reconnect_delivers_each_notification_once() {
    let (controller, device) = controller_for(SimulatedProfile::default());
    let mut events = controller.subscribe_events();

    controller.connect().await.expect("first connect");
    controller.disconnect().await;
    controller.connect().await.expect("second connect");
    assert_eq!(device.stats().connect_calls, 2);
    drain(&mut events);

    assert_eq!(device.notify_primary(b"S").await, 1);
    wait_for_counter(&mut events, 2).await;
    device.notify_primary(b"D").await;
    wait_for_counter(&mut events, 4).await;
    assert!(drain(&mut events).is_empty());
    assert_eq!(controller.snapshot().await.counter, 4);
}

#[tokio::test]
async fn connect_is_refused_while_busy_or_connected() {
    let (controller, device) = controller_for(SimulatedProfile::default());

    device.hold_discovery();
    let pending = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.connect().await }
    });
    device.wait_for_stats(|s| s.discover_calls >= 1).await;
    assert!(matches!(
        controller.connect().await,
        Err(ConnectError::InProgress)
    ));
    assert_eq!(device.stats().discover_calls, 1);

    device.release_discovery();
    timeout(WAIT, pending)
        .await
        .expect("attempt ends")
        .expect("join")
        .expect("connect");
    assert!(matches!(
        controller.connect().await,
        Err(ConnectError::AlreadyConnected)
    ));
}

/// Hands out links that the device has already dropped.
struct ClosedOnArrival(SimulatedCapability);

#[async_trait]
impl PeripheralCapability for ClosedOnArrival {
    async fn discover(&self, filter: DiscoveryFilter) -> Result<PeripheralHandle, PeripheralError> {
        self.0.discover(filter).await
    }

    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Arc<dyn PeripheralLink>, PeripheralError> {
        let link = self.0.connect(peripheral).await?;
        self.0.device().drop_link().await;
        Ok(link)
    }
}

#[tokio::test]
async fn link_closed_before_watcher_starts_is_not_promoted() {
    let capability = SimulatedCapability::new(SimulatedProfile::default());
    let device = capability.device();
    let controller = SessionController::new(Arc::new(ClosedOnArrival(capability)));
    let mut events = controller.subscribe_events();

    let result = controller.connect().await;
    assert!(matches!(result, Err(ConnectError::Superseded)));

    let snapshot = controller.snapshot().await;
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert_eq!(snapshot.peripheral, None);
    assert_eq!(device.stats().subscribe_calls, 0);

    let emitted = drain(&mut events);
    assert_eq!(
        states(&emitted),
        vec![ConnectionState::Scanning, ConnectionState::Disconnected]
    );
    assert!(emitted.iter().all(|e| !matches!(e, SessionEvent::Error { .. })));
}
