//! The session coordinator: owns the connection state machine and wires the
//! transport, decoder, calibration engine and observers together.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use btleplug::api::BDAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use crate::bluetooth::constants::SCAN_POLL_INTERVAL;
use crate::bluetooth::{PeripheralHandle, Transport};
use crate::calibration::{Calibration, CalibrationEngine, CalibrationStep, CalibrationStore, FeedOutcome};
use crate::config::AppConfig;
use crate::error::{SessionError, TransportError};
use crate::session::commands::Command;
use crate::session::events::{
    EventBroker, EventFilter, LevelReading, LevelSource, SessionEvent, SubscriptionHandle,
};
use crate::telemetry::{SensorReading, TelemetryDecoder};

/// Opaque identity of the person a stream of readings is attributed to:
/// the device owner, or a specific patient in caretaker mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The connection state machine. One instance per coordinator, transitions
/// serialized by the coordinator's lock.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting(PeripheralHandle),
    Connected(PeripheralHandle),
    Disconnecting,
    /// A transport operation failed. Cleared by the next explicit `connect`
    /// or `start_scan`; the coordinator never retries on its own.
    Faulted(TransportError),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting(handle) => write!(f, "connecting to {}", handle),
            Self::Connected(handle) => write!(f, "connected to {}", handle),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Faulted(err) => write!(f, "faulted: {}", err),
        }
    }
}

/// Consumption-accounting collaborator. Receives one event per computed
/// volume reading; aggregation happens elsewhere.
pub trait ConsumptionSink: Send + Sync {
    fn record(&self, subject_id: &SubjectId, volume_ml: f64, timestamp: DateTime<Utc>);
}

#[derive(Default)]
struct TaskSet {
    pump: Option<JoinHandle<()>>,
    scan: Option<JoinHandle<()>>,
    sleep: Option<JoinHandle<()>>,
}

/// Orchestrates one physical bottle link.
///
/// Cheap to clone; clones share all state. Background tasks (the reading
/// pump, the scan publisher) each hold a clone.
#[derive(Clone)]
pub struct SessionCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CalibrationStore>,
    sink: Option<Arc<dyn ConsumptionSink>>,
    decoder: Arc<TelemetryDecoder>,
    broker: EventBroker,
    state: Arc<Mutex<ConnectionState>>,
    engine: Arc<Mutex<CalibrationEngine>>,
    subject: Arc<Mutex<Option<SubjectId>>>,
    tasks: Arc<Mutex<TaskSet>>,
    dispatched: Arc<AtomicU64>,
    config: AppConfig,
}

impl SessionCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CalibrationStore>,
        config: AppConfig,
    ) -> Self {
        Self {
            transport,
            store,
            sink: None,
            decoder: Arc::new(TelemetryDecoder::new()),
            broker: EventBroker::new(),
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            engine: Arc::new(Mutex::new(
                CalibrationEngine::new(config.bottle_capacity_ml)
                    .with_sample_count(config.calibration_samples),
            )),
            subject: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(TaskSet::default())),
            dispatched: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Attach the consumption-accounting collaborator.
    pub fn with_accounting(mut self, sink: Arc<dyn ConsumptionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    pub fn active_subject(&self) -> Option<SubjectId> {
        self.subject.lock().unwrap().clone()
    }

    /// Payloads the decoder has discarded since startup.
    pub fn dropped_payloads(&self) -> u64 {
        self.decoder.dropped_payloads()
    }

    /// Decoded readings dispatched to observers since startup.
    pub fn readings_dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub async fn devices(&self) -> Vec<PeripheralHandle> {
        self.transport.devices().await
    }

    // ---- observer registration -------------------------------------------

    pub fn subscribe(&self, filter: EventFilter) -> (SubscriptionHandle, Receiver<SessionEvent>) {
        self.broker.subscribe(filter)
    }

    pub fn subscribe_readings(&self) -> (SubscriptionHandle, Receiver<SessionEvent>) {
        self.broker.subscribe(EventFilter::readings_only())
    }

    pub fn subscribe_connection(&self) -> (SubscriptionHandle, Receiver<SessionEvent>) {
        self.broker.subscribe(EventFilter::connection_only())
    }

    pub fn subscribe_devices(&self) -> (SubscriptionHandle, Receiver<SessionEvent>) {
        self.broker.subscribe(EventFilter::devices_only())
    }

    // ---- scanning --------------------------------------------------------

    /// Start a discovery pass. The growing device list is published to
    /// observers while the scan runs. Idempotent while already scanning.
    pub async fn start_scan(&self) -> Result<(), SessionError> {
        match self.connection_state() {
            ConnectionState::Connecting(_) => {
                return Err(TransportError::ConnectInProgress.into());
            }
            ConnectionState::Connected(handle) => {
                return Err(TransportError::Api(format!(
                    "cannot scan while connected to {}",
                    handle.address
                ))
                .into());
            }
            ConnectionState::Disconnecting => {
                return Err(TransportError::Api("disconnect in progress".to_string()).into());
            }
            ConnectionState::Scanning => return Ok(()),
            ConnectionState::Faulted(err) => {
                log::info!("Clearing fault ({}) for new scan", err);
            }
            ConnectionState::Idle => {}
        }
        self.set_state(ConnectionState::Scanning);

        let this = self.clone();
        let timeout = self.config.scan_timeout();
        let handle = tokio::spawn(async move {
            let scan = this.transport.scan(timeout);
            tokio::pin!(scan);
            let mut poll = tokio::time::interval(SCAN_POLL_INTERVAL);
            loop {
                tokio::select! {
                    result = &mut scan => {
                        match result {
                            Ok(devices) => {
                                log::info!("Scan finished with {} device(s)", devices.len());
                                this.broker.publish(SessionEvent::DevicesUpdated(devices));
                            }
                            Err(TransportError::ScanTimeout(elapsed)) => {
                                log::info!("Scan deadline reached after {:?}", elapsed);
                                let devices = this.transport.devices().await;
                                this.broker.publish(SessionEvent::DevicesUpdated(devices));
                            }
                            Err(err) => {
                                let _ = this.fault(err);
                                return;
                            }
                        }
                        if this.connection_state() == ConnectionState::Scanning {
                            this.set_state(ConnectionState::Idle);
                        }
                        return;
                    }
                    _ = poll.tick() => {
                        let devices = this.transport.devices().await;
                        this.broker.publish(SessionEvent::DevicesUpdated(devices));
                    }
                }
            }
        });
        self.tasks.lock().unwrap().scan = Some(handle);
        Ok(())
    }

    /// End an in-progress discovery pass early.
    pub async fn stop_scan(&self) -> Result<(), SessionError> {
        self.transport.stop_scan().await.map_err(|err| self.fault(err))?;
        if self.connection_state() == ConnectionState::Scanning {
            self.set_state(ConnectionState::Idle);
        }
        Ok(())
    }

    // ---- connection lifecycle --------------------------------------------

    /// Connect to a previously discovered bottle. A second call while an
    /// attempt is in flight is rejected, never queued. On success the
    /// active subject's calibration is loaded and the reading pipeline
    /// starts.
    pub async fn connect(&self, address: BDAddr) -> Result<(), SessionError> {
        let handle = self
            .transport
            .devices()
            .await
            .into_iter()
            .find(|device| device.address == address)
            // no state transition: a bad address must not disturb an
            // attempt that is already in flight
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;

        let was_scanning = {
            let mut state = self.state.lock().unwrap();
            match &*state {
                ConnectionState::Connecting(_) => {
                    return Err(TransportError::ConnectInProgress.into());
                }
                ConnectionState::Connected(current) => {
                    return Err(TransportError::Api(format!(
                        "already connected to {}",
                        current.address
                    ))
                    .into());
                }
                ConnectionState::Disconnecting => {
                    return Err(
                        TransportError::Api("disconnect in progress".to_string()).into()
                    );
                }
                ConnectionState::Faulted(err) => {
                    log::info!("Clearing fault ({}) for new connection attempt", err);
                    *state = ConnectionState::Connecting(handle.clone());
                    false
                }
                ConnectionState::Scanning => {
                    *state = ConnectionState::Connecting(handle.clone());
                    true
                }
                ConnectionState::Idle => {
                    *state = ConnectionState::Connecting(handle.clone());
                    false
                }
            }
        };
        log::info!("Connecting to {}", handle);
        self.broker
            .publish(SessionEvent::ConnectionChanged(ConnectionState::Connecting(
                handle.clone(),
            )));

        if was_scanning {
            if let Err(err) = self.transport.stop_scan().await {
                log::warn!("Could not stop scan before connecting: {}", err);
            }
        }

        if let Err(err) = self.transport.connect(address).await {
            return Err(self.fault(err));
        }
        self.set_state(ConnectionState::Connected(handle));

        if let Some(subject) = self.active_subject() {
            self.load_calibration_for(&subject);
        }

        let notifications = match self.transport.subscribe().await {
            Ok(rx) => rx,
            Err(err) => {
                let _ = self.transport.disconnect().await;
                return Err(self.fault(err));
            }
        };
        self.spawn_reading_pump(notifications);
        Ok(())
    }

    /// Tear down the link. Safe to call from any state; always routes
    /// through the single cleanup path. An armed calibration step is
    /// abandoned without touching captured baselines.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        if self.connection_state() == ConnectionState::Disconnecting {
            return Ok(());
        }
        self.teardown_link(true).await
    }

    /// Release everything: scan, link and background tasks. Call once when
    /// the process shuts down.
    pub async fn shutdown(&self) {
        let _ = self.transport.stop_scan().await;
        let (scan, sleep) = {
            let mut tasks = self.tasks.lock().unwrap();
            (tasks.scan.take(), tasks.sleep.take())
        };
        if let Some(task) = scan {
            task.abort();
        }
        if let Some(task) = sleep {
            task.abort();
        }
        let _ = self.teardown_link(true).await;
        log::info!("Session coordinator shut down");
    }

    async fn teardown_link(&self, abort_pump: bool) -> Result<(), SessionError> {
        self.set_state(ConnectionState::Disconnecting);
        self.engine.lock().unwrap().cancel();
        let pump = self.tasks.lock().unwrap().pump.take();
        if abort_pump {
            if let Some(task) = pump {
                task.abort();
            }
        }
        let result = self.transport.disconnect().await;
        self.set_state(ConnectionState::Idle);
        result.map_err(SessionError::Transport)
    }

    fn spawn_reading_pump(&self, mut notifications: Receiver<crate::bluetooth::RawNotification>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(raw) = notifications.recv().await {
                if let Some(reading) = this.decoder.decode(&raw) {
                    this.handle_reading(reading);
                }
            }
            log::info!("Notification stream ended");
            if matches!(this.connection_state(), ConnectionState::Connected(_)) {
                // peripheral-initiated drop: clean up without aborting
                // ourselves mid-teardown
                let _ = this.teardown_link(false).await;
            }
        });
        let previous = self.tasks.lock().unwrap().pump.replace(handle);
        if let Some(task) = previous {
            task.abort();
        }
    }

    // ---- subjects and calibration ----------------------------------------

    /// Rebind whose consumption subsequent readings are attributed to and
    /// load that subject's persisted calibration. Cancels any armed
    /// calibration step.
    pub fn set_active_subject(&self, subject: SubjectId) -> Result<(), SessionError> {
        log::info!("Active subject is now {}", subject);
        self.engine.lock().unwrap().cancel();
        *self.subject.lock().unwrap() = Some(subject.clone());
        self.load_calibration_for(&subject);
        Ok(())
    }

    fn load_calibration_for(&self, subject: &SubjectId) {
        match self.store.load(subject.as_str()) {
            Ok(Some(calibration)) => {
                log::info!(
                    "Loaded calibration for {} (empty {}mm, full {}mm)",
                    subject,
                    calibration.empty_baseline_mm,
                    calibration.full_baseline_mm
                );
                self.engine.lock().unwrap().install(Some(calibration));
            }
            Ok(None) => {
                log::info!("No stored calibration for {}", subject);
                self.engine.lock().unwrap().install(None);
            }
            Err(err) => {
                log::warn!("Could not load calibration for {}: {}", subject, err);
                self.engine.lock().unwrap().install(None);
            }
        }
    }

    /// Arm a calibration collection step. Requires an active subject so the
    /// finished calibration has somewhere to be persisted.
    pub fn begin_calibration(&self, step: CalibrationStep) -> Result<(), SessionError> {
        if self.active_subject().is_none() {
            return Err(SessionError::NoActiveSubject);
        }
        self.engine.lock().unwrap().begin_step(step);
        Ok(())
    }

    /// Abandon an armed calibration step. Captured baselines and any
    /// completed calibration survive.
    pub fn cancel_calibration(&self) {
        self.engine.lock().unwrap().cancel();
    }

    /// Feed one reading to the armed calibration step. Completion persists
    /// the new calibration for the active subject.
    pub fn feed_reading_to_calibration(
        &self,
        reading: &SensorReading,
    ) -> Result<FeedOutcome, SessionError> {
        let outcome = self.engine.lock().unwrap().feed(reading.distance_mm)?;
        if let FeedOutcome::Completed(calibration) = &outcome {
            self.persist_calibration(calibration)?;
        }
        Ok(outcome)
    }

    /// The active subject's calibration, if one is installed.
    pub fn calibration(&self) -> Option<Calibration> {
        self.engine.lock().unwrap().calibration().cloned()
    }

    fn persist_calibration(&self, calibration: &Calibration) -> Result<(), SessionError> {
        let subject = self.active_subject().ok_or(SessionError::NoActiveSubject)?;
        self.store.save(subject.as_str(), calibration)?;
        log::info!("Calibration persisted for {}", subject);
        Ok(())
    }

    // ---- reading dispatch ------------------------------------------------

    /// Per-reading dispatch: route to an armed calibration step, compute the
    /// level, push to observers and to accounting.
    fn handle_reading(&self, reading: SensorReading) {
        {
            let mut engine = self.engine.lock().unwrap();
            if engine.is_collecting() {
                match engine.feed(reading.distance_mm) {
                    Ok(FeedOutcome::Completed(calibration)) => {
                        drop(engine);
                        if let Err(err) = self.persist_calibration(&calibration) {
                            log::warn!("Completed calibration not persisted: {}", err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("Calibration sample rejected: {}", err),
                }
            }
        }

        let level = self.compute_level(&reading);

        if let Some(sink) = &self.sink {
            match (self.active_subject(), level.volume_ml) {
                (Some(subject), Some(volume_ml)) => {
                    sink.record(&subject, volume_ml, Utc::now());
                }
                (None, Some(_)) => {
                    log::debug!("{}; skipping consumption accounting", SessionError::NoActiveSubject);
                }
                _ => {}
            }
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.broker.publish(SessionEvent::Reading { reading, level });
    }

    fn compute_level(&self, reading: &SensorReading) -> LevelReading {
        let calibration = self.engine.lock().unwrap().calibration().cloned();

        // physical-sanity gate: closer than the sensor can resolve means
        // no bottle under the sensor at all
        if reading.distance_mm < self.config.min_valid_distance_mm {
            return LevelReading {
                level_pct: 0.0,
                volume_ml: calibration.map(|_| 0.0),
                source: LevelSource::OutOfRange,
            };
        }

        if let Some(calibration) = calibration {
            LevelReading {
                level_pct: calibration.level_pct(reading.distance_mm),
                volume_ml: Some(calibration.volume_ml(reading.distance_mm)),
                source: LevelSource::Calibrated,
            }
        } else if let Some(raw_pct) = reading.raw_level_pct {
            LevelReading {
                level_pct: raw_pct,
                volume_ml: None,
                source: LevelSource::DeviceReported,
            }
        } else {
            LevelReading {
                level_pct: 0.0,
                volume_ml: None,
                source: LevelSource::Unknown,
            }
        }
    }

    // ---- control commands ------------------------------------------------

    /// Send a deep-sleep command, then assume the peripheral drops the link
    /// itself once the grace period passes.
    pub async fn enter_sleep(&self, duration_minutes: u32) -> Result<(), SessionError> {
        self.send_command(Command::deep_sleep(duration_minutes)).await?;

        let this = self.clone();
        let grace = self.config.sleep_grace();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if matches!(this.connection_state(), ConnectionState::Connected(_)) {
                log::info!("Sleep grace period elapsed, tearing down link");
                let _ = this.disconnect().await;
            }
        });
        let previous = self.tasks.lock().unwrap().sleep.replace(handle);
        if let Some(task) = previous {
            task.abort();
        }
        Ok(())
    }

    /// Wake the peripheral from light sleep.
    pub async fn wake(&self) -> Result<(), SessionError> {
        self.send_raw_command("wake").await
    }

    /// Write a caller-supplied command string verbatim.
    pub async fn send_raw_command(&self, command: &str) -> Result<(), SessionError> {
        self.write_payload(command.as_bytes()).await
    }

    /// Serialize a structured envelope and write it to the control
    /// characteristic.
    pub async fn send_command(&self, command: Command) -> Result<(), SessionError> {
        let payload = command
            .encode()
            .map_err(|err| SessionError::CommandEncoding(err.to_string()))?;
        self.write_payload(&payload).await
    }

    async fn write_payload(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.transport
            .write(payload)
            .await
            .map_err(|err| self.fault(err))
    }

    // ---- state machine ---------------------------------------------------

    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            if *state == next {
                return;
            }
            std::mem::replace(&mut *state, next.clone())
        };
        log::info!("Connection state: {} -> {}", previous, next);
        self.broker
            .publish(SessionEvent::ConnectionChanged(next));
    }

    fn fault(&self, err: TransportError) -> SessionError {
        log::error!("Transport fault: {}", err);
        self.set_state(ConnectionState::Faulted(err.clone()));
        SessionError::Transport(err)
    }
}
