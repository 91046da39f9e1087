// Common test utilities shared across integration test modules
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::BDAddr;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::timeout;

use aquasense::{
    AppConfig, Calibration, CalibrationStore, ConsumptionSink, PeripheralHandle, RawNotification,
    StoreError, SubjectId, Transport, TransportError,
};

/// Helper function to run an async operation with timeout
pub async fn with_timeout<T, F>(duration_secs: u64, future: F) -> Result<T, &'static str>
where
    F: Future<Output = T>,
{
    match timeout(Duration::from_secs(duration_secs), future).await {
        Ok(result) => Ok(result),
        Err(_) => Err("Operation timed out"),
    }
}

/// Utility function to wait for a specific duration
pub async fn wait_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn bottle_address() -> BDAddr {
    BDAddr::from([0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC])
}

pub fn bottle_handle() -> PeripheralHandle {
    PeripheralHandle::new(
        bottle_address(),
        Some("SmartBottle-01".to_string()),
        Some(-60),
    )
}

/// Config with short timeouts so tests run quickly.
pub fn test_config() -> AppConfig {
    AppConfig {
        scan_timeout_secs: 1,
        connect_timeout_secs: 1,
        sleep_grace_secs: 0,
        ..AppConfig::default()
    }
}

pub fn complete_calibration(empty_mm: f64, full_mm: f64) -> Calibration {
    Calibration {
        empty_baseline_mm: empty_mm,
        full_baseline_mm: full_mm,
        bottle_capacity_ml: 750,
        calibrated_at: Utc::now(),
        is_complete: true,
    }
}

/// In-process transport fake: a fixed device list, a controllable link and
/// a notification channel tests can push payloads into.
pub struct FakeTransport {
    devices: Vec<PeripheralHandle>,
    connect_attempts: AtomicUsize,
    connect_delay: Duration,
    connected: AtomicBool,
    writes: Mutex<Vec<Vec<u8>>>,
    notifications: Mutex<Option<Sender<RawNotification>>>,
}

impl FakeTransport {
    pub fn new(devices: Vec<PeripheralHandle>) -> Self {
        Self {
            devices,
            connect_attempts: AtomicUsize::new(0),
            connect_delay: Duration::from_millis(50),
            connected: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
            notifications: Mutex::new(None),
        }
    }

    pub fn with_bottle() -> Self {
        Self::new(vec![bottle_handle()])
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Deliver one notification payload as if the peripheral pushed it.
    pub async fn push_notification(&self, payload: &str) {
        let sender = self.notifications.lock().unwrap().clone();
        let sender = sender.expect("no active subscription");
        sender
            .send(RawNotification {
                source_id: bottle_address().to_string(),
                value: payload.as_bytes().to_vec(),
            })
            .await
            .expect("notification receiver dropped");
    }

    /// Simulate a peripheral-initiated link drop.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.notifications.lock().unwrap() = None;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<PeripheralHandle>, TransportError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.devices.clone())
    }

    async fn devices(&self) -> Vec<PeripheralHandle> {
        self.devices.clone()
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, address: BDAddr) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.connect_delay).await;
        if !self.devices.iter().any(|device| device.address == address) {
            return Err(TransportError::DeviceNotFound(address.to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        *self.notifications.lock().unwrap() = None;
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.writes.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Receiver<RawNotification>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = channel(64);
        *self.notifications.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

/// In-memory calibration store for tests.
#[derive(Default)]
pub struct MemoryCalibrationStore {
    records: Mutex<HashMap<String, Calibration>>,
}

impl MemoryCalibrationStore {
    pub fn seeded(subject: &str, calibration: Calibration) -> Self {
        let store = Self::default();
        store
            .records
            .lock()
            .unwrap()
            .insert(subject.to_string(), calibration);
        store
    }

    pub fn get(&self, subject: &str) -> Option<Calibration> {
        self.records.lock().unwrap().get(subject).cloned()
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn load(&self, subject_id: &str) -> Result<Option<Calibration>, StoreError> {
        Ok(self.records.lock().unwrap().get(subject_id).cloned())
    }

    fn save(&self, subject_id: &str, calibration: &Calibration) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(subject_id.to_string(), calibration.clone());
        Ok(())
    }
}

/// Consumption-accounting fake that records every event it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(SubjectId, f64)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(SubjectId, f64)> {
        self.events.lock().unwrap().clone()
    }
}

impl ConsumptionSink for RecordingSink {
    fn record(&self, subject_id: &SubjectId, volume_ml: f64, _timestamp: DateTime<Utc>) {
        self.events
            .lock()
            .unwrap()
            .push((subject_id.clone(), volume_ml));
    }
}
