// Integration tests for the session coordinator over a fake transport.

mod common_test_helpers;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::Value;

use aquasense::{
    CalibrationStep, ConnectionState, LevelSource, SessionCoordinator, SessionError, SessionEvent,
    SubjectId, TransportError,
};
use common_test_helpers::*;

fn coordinator_with(
    transport: Arc<FakeTransport>,
    store: Arc<MemoryCalibrationStore>,
) -> SessionCoordinator {
    SessionCoordinator::new(transport, store, test_config())
}

async fn wait_for_idle(coordinator: &SessionCoordinator) {
    for _ in 0..100 {
        if coordinator.connection_state() == ConnectionState::Idle {
            return;
        }
        wait_ms(20).await;
    }
    panic!(
        "coordinator never returned to idle (state: {})",
        coordinator.connection_state()
    );
}

#[tokio::test]
async fn test_connect_streams_calibrated_readings() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::seeded(
        "alice",
        complete_calibration(140.0, 20.0),
    ));
    let sink = Arc::new(RecordingSink::default());
    let coordinator =
        coordinator_with(transport.clone(), store).with_accounting(sink.clone());
    coordinator
        .set_active_subject(SubjectId::from("alice"))
        .unwrap();

    coordinator.connect(bottle_address()).await.unwrap();
    assert!(matches!(
        coordinator.connection_state(),
        ConnectionState::Connected(_)
    ));

    let (_subscription, mut events) = coordinator.subscribe_readings();
    transport.push_notification(r#"{"distance": 80.0}"#).await;

    let event = with_timeout(5, events.recv()).await.unwrap().unwrap();
    let SessionEvent::Reading { reading, level } = event else {
        panic!("expected a reading event");
    };
    assert_eq!(reading.distance_mm, 80.0);
    assert_eq!(level.level_pct, 50.0);
    assert_eq!(level.volume_ml, Some(375.0));
    assert_eq!(level.source, LevelSource::Calibrated);

    assert_eq!(sink.events(), vec![(SubjectId::from("alice"), 375.0)]);
}

#[tokio::test]
async fn test_concurrent_connect_makes_single_attempt() {
    let transport = Arc::new(
        FakeTransport::with_bottle().with_connect_delay(Duration::from_millis(200)),
    );
    let store = Arc::new(MemoryCalibrationStore::default());
    let coordinator = coordinator_with(transport.clone(), store);

    let (first, second) = tokio::join!(
        coordinator.connect(bottle_address()),
        coordinator.connect(bottle_address()),
    );

    let errors: Vec<_> = [first, second].into_iter().filter_map(Result::err).collect();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        SessionError::Transport(TransportError::ConnectInProgress)
    ));
    assert_eq!(transport.connect_attempts(), 1);
    assert!(matches!(
        coordinator.connection_state(),
        ConnectionState::Connected(_)
    ));
}

#[tokio::test]
async fn test_garbage_payloads_never_surface() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::default());
    let coordinator = coordinator_with(transport.clone(), store);
    coordinator.connect(bottle_address()).await.unwrap();

    let (_subscription, mut events) = coordinator.subscribe_readings();
    transport.push_notification("garbage").await;
    transport.push_notification(r#"{"foo": 1}"#).await;
    transport.push_notification("80").await;

    let event = with_timeout(5, events.recv()).await.unwrap().unwrap();
    let SessionEvent::Reading { reading, .. } = event else {
        panic!("expected a reading event");
    };
    assert_eq!(reading.distance_mm, 80.0);
    assert!(matches!(
        coordinator.connection_state(),
        ConnectionState::Connected(_)
    ));
    assert_eq!(coordinator.dropped_payloads(), 2);
}

#[tokio::test]
async fn test_short_distance_forced_to_zero() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::seeded(
        "alice",
        complete_calibration(140.0, 20.0),
    ));
    let coordinator = coordinator_with(transport.clone(), store);
    coordinator
        .set_active_subject(SubjectId::from("alice"))
        .unwrap();
    coordinator.connect(bottle_address()).await.unwrap();

    let (_subscription, mut events) = coordinator.subscribe_readings();
    transport.push_notification("30").await;

    let event = with_timeout(5, events.recv()).await.unwrap().unwrap();
    let SessionEvent::Reading { level, .. } = event else {
        panic!("expected a reading event");
    };
    assert_eq!(level.level_pct, 0.0);
    assert_eq!(level.source, LevelSource::OutOfRange);
}

#[tokio::test]
async fn test_calibration_ritual_persists() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::default());
    let coordinator = coordinator_with(transport.clone(), store.clone());
    coordinator
        .set_active_subject(SubjectId::from("alice"))
        .unwrap();
    coordinator.connect(bottle_address()).await.unwrap();
    let (_subscription, mut events) = coordinator.subscribe_readings();

    coordinator
        .begin_calibration(CalibrationStep::Empty)
        .unwrap();
    for distance in [120, 121, 119, 118, 122, 117, 116, 123, 121, 119] {
        transport.push_notification(&distance.to_string()).await;
    }
    for _ in 0..10 {
        with_timeout(5, events.recv()).await.unwrap().unwrap();
    }

    coordinator
        .begin_calibration(CalibrationStep::Full)
        .unwrap();
    for distance in [30, 32, 29, 31, 28, 33, 27, 34, 30, 29] {
        transport.push_notification(&distance.to_string()).await;
    }
    for _ in 0..10 {
        with_timeout(5, events.recv()).await.unwrap().unwrap();
    }

    let stored = store.get("alice").expect("calibration was not persisted");
    assert_eq!(stored.empty_baseline_mm, 123.0);
    assert_eq!(stored.full_baseline_mm, 27.0);
    assert!(stored.is_complete);
}

#[tokio::test]
async fn test_disconnect_while_collecting_preserves_calibration() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::seeded(
        "alice",
        complete_calibration(140.0, 20.0),
    ));
    let coordinator = coordinator_with(transport.clone(), store.clone());
    coordinator
        .set_active_subject(SubjectId::from("alice"))
        .unwrap();
    coordinator.connect(bottle_address()).await.unwrap();
    let (_subscription, mut events) = coordinator.subscribe_readings();

    coordinator
        .begin_calibration(CalibrationStep::Empty)
        .unwrap();
    for distance in [100, 101, 102] {
        transport.push_notification(&distance.to_string()).await;
    }
    for _ in 0..3 {
        with_timeout(5, events.recv()).await.unwrap().unwrap();
    }

    coordinator.disconnect().await.unwrap();
    assert_eq!(coordinator.connection_state(), ConnectionState::Idle);
    assert_eq!(store.get("alice").unwrap().empty_baseline_mm, 140.0);
    assert_eq!(coordinator.calibration().unwrap().empty_baseline_mm, 140.0);
}

#[tokio::test]
async fn test_peripheral_drop_returns_to_idle() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::default());
    let coordinator = coordinator_with(transport.clone(), store);
    coordinator.connect(bottle_address()).await.unwrap();

    transport.drop_link();
    wait_for_idle(&coordinator).await;
}

#[tokio::test]
async fn test_scan_publishes_device_list() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::default());
    let coordinator = coordinator_with(transport.clone(), store);

    let (_subscription, mut devices_rx) = coordinator.subscribe_devices();
    coordinator.start_scan().await.unwrap();
    assert_eq!(coordinator.connection_state(), ConnectionState::Scanning);

    let event = with_timeout(5, devices_rx.recv()).await.unwrap().unwrap();
    let SessionEvent::DevicesUpdated(devices) = event else {
        panic!("expected a device-list event");
    };
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address, bottle_address());

    wait_for_idle(&coordinator).await;
}

#[tokio::test]
async fn test_enter_sleep_commands_and_disconnects() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::default());
    let coordinator = coordinator_with(transport.clone(), store);
    coordinator.connect(bottle_address()).await.unwrap();

    coordinator.enter_sleep(30).await.unwrap();

    let writes = transport.written();
    assert_eq!(writes.len(), 1);
    let envelope: Value = serde_json::from_slice(&writes[0]).unwrap();
    assert_eq!(envelope["action"], "deep_sleep");
    assert_eq!(envelope["duration_minutes"], 30);

    // grace period is zero in the test config
    wait_for_idle(&coordinator).await;
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_switching_subject_swaps_calibration() {
    let transport = Arc::new(FakeTransport::with_bottle());
    let store = Arc::new(MemoryCalibrationStore::seeded(
        "alice",
        complete_calibration(140.0, 20.0),
    ));
    let coordinator = coordinator_with(transport, store);

    coordinator
        .set_active_subject(SubjectId::from("alice"))
        .unwrap();
    assert!(coordinator.calibration().is_some());

    coordinator
        .set_active_subject(SubjectId::from("bob"))
        .unwrap();
    assert!(coordinator.calibration().is_none());
}
