//! btleplug-backed transport implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc::{channel, Receiver};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bluetooth::constants::{
    self, DEFAULT_CONNECT_TIMEOUT, DEVICE_NAME_PREFIX, SCAN_POLL_INTERVAL, WRITE_DEADLINE,
};
use crate::bluetooth::transport::{PeripheralHandle, RawNotification, Transport};
use crate::error::TransportError;

/// Capacity of the raw-notification forwarding channel.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

/// The resolved GATT endpoints of an established link.
struct ActiveLink {
    peripheral: Peripheral,
    data_char: Characteristic,
    control_char: Option<Characteristic>,
    forward_task: Option<JoinHandle<()>>,
}

/// Production transport over the platform Bluetooth stack.
///
/// Owns at most one link at a time. Every teardown, whether requested by the
/// caller or forced by a failure, goes through [`BleTransport::teardown`] so
/// the platform handle and resolved characteristics are released before any
/// state is reported upward.
pub struct BleTransport {
    adapter: Adapter,
    connect_timeout: Duration,
    write_deadline: Duration,
    scanning: AtomicBool,
    devices: tokio::sync::Mutex<HashMap<BDAddr, (Peripheral, PeripheralHandle)>>,
    link: tokio::sync::Mutex<Option<ActiveLink>>,
}

impl BleTransport {
    /// Create a transport bound to the first available adapter.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(TransportError::from)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(TransportError::from)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TransportError::RadioUnavailable("no Bluetooth adapter present".to_string())
            })?;

        info!(
            "Using Bluetooth adapter {}",
            adapter
                .adapter_info()
                .await
                .unwrap_or_else(|_| "unknown".to_string())
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport over a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_deadline: WRITE_DEADLINE,
            scanning: AtomicBool::new(false),
            devices: tokio::sync::Mutex::new(HashMap::new()),
            link: tokio::sync::Mutex::new(None),
        }
    }

    /// Override the fail-fast connection deadline.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Override the control-write deadline.
    pub fn with_write_deadline(mut self, write_deadline: Duration) -> Self {
        self.write_deadline = write_deadline;
        self
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn device_snapshot(&self) -> Vec<PeripheralHandle> {
        self.devices
            .lock()
            .await
            .values()
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    /// Examine one advertisement and record the peripheral if it looks like
    /// a bottle: either it advertises the expected service, or its name
    /// carries the known prefix.
    async fn ingest_advertisement(&self, id: &PeripheralId) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                debug!("Could not resolve advertised peripheral: {}", err);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => return,
            Err(err) => {
                debug!("Could not query peripheral properties: {}", err);
                return;
            }
        };

        let advertises_service = properties
            .services
            .contains(&constants::bottle_service_uuid());
        let name_matches = properties
            .local_name
            .as_deref()
            .map_or(false, |name| name.starts_with(DEVICE_NAME_PREFIX));

        if !advertises_service && !name_matches {
            return;
        }

        let handle = PeripheralHandle::new(
            peripheral.address(),
            properties.local_name,
            properties.rssi,
        );
        debug!("Discovered candidate bottle {}", handle);
        self.devices
            .lock()
            .await
            .insert(handle.address, (peripheral, handle));
    }

    /// Resolve the telemetry and control characteristics after service
    /// discovery. Prefers the documented UUIDs; falls back to the first
    /// notifiable (and first writable) characteristic when the expected
    /// service is absent.
    async fn resolve_characteristics(
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, Option<Characteristic>), TransportError> {
        peripheral
            .discover_services()
            .await
            .map_err(TransportError::from)?;

        let services = peripheral.services();
        if services.is_empty() {
            return Err(TransportError::ServiceNotFound);
        }

        let expected = services
            .iter()
            .find(|service| service.uuid == constants::bottle_service_uuid());

        let characteristics: Vec<&Characteristic> = match expected {
            Some(service) => service.characteristics.iter().collect(),
            None => {
                warn!("Expected bottle service absent; falling back to characteristic search");
                services
                    .iter()
                    .flat_map(|service| service.characteristics.iter())
                    .collect()
            }
        };

        let data_char = characteristics
            .iter()
            .find(|c| {
                c.uuid == constants::telemetry_characteristic_uuid()
                    && c.properties.contains(CharPropFlags::NOTIFY)
            })
            .or_else(|| {
                characteristics
                    .iter()
                    .find(|c| c.properties.contains(CharPropFlags::NOTIFY))
            })
            .copied()
            .cloned()
            .ok_or_else(|| {
                TransportError::CharacteristicNotFound(
                    "no notifiable characteristic exposed".to_string(),
                )
            })?;

        let control_char = characteristics
            .iter()
            .find(|c| {
                c.uuid == constants::control_characteristic_uuid()
                    && c.properties
                        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
            })
            .or_else(|| {
                characteristics.iter().find(|c| {
                    c.properties
                        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
                })
            })
            .copied()
            .cloned();

        Ok((data_char, control_char))
    }

    /// The single cleanup path. Aborts the notification forwarder, releases
    /// the subscription and the platform handle, and clears the resolved
    /// characteristics.
    async fn teardown(&self) {
        let link = self.link.lock().await.take();
        if let Some(mut link) = link {
            if let Some(task) = link.forward_task.take() {
                task.abort();
            }
            let _ = link.peripheral.unsubscribe(&link.data_char).await;
            if let Err(err) = link.peripheral.disconnect().await {
                warn!("Error while disconnecting peripheral: {}", err);
            }
            info!("Link to {} released", link.peripheral.address());
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&self, scan_timeout: Duration) -> Result<Vec<PeripheralHandle>, TransportError> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("Scan already in progress; returning current result set");
            return Ok(self.device_snapshot().await);
        }

        self.devices.lock().await.clear();

        let filter = ScanFilter {
            services: vec![constants::bottle_service_uuid()],
        };
        if let Err(err) = self.adapter.start_scan(filter).await {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(err.into());
        }

        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(err) => {
                let _ = self.adapter.stop_scan().await;
                self.scanning.store(false, Ordering::SeqCst);
                return Err(err.into());
            }
        };

        info!("Scanning for bottles ({:?} deadline)", scan_timeout);
        let deadline = tokio::time::sleep(scan_timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(SCAN_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = poll.tick() => {
                    // an external stop_scan clears the flag
                    if !self.scanning.load(Ordering::SeqCst) {
                        break;
                    }
                }
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id)) => {
                        self.ingest_advertisement(&id).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }

        let _ = self.adapter.stop_scan().await;
        self.scanning.store(false, Ordering::SeqCst);

        let found = self.device_snapshot().await;
        info!("Scan finished with {} candidate bottle(s)", found.len());
        Ok(found)
    }

    async fn devices(&self) -> Vec<PeripheralHandle> {
        self.device_snapshot().await
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.adapter
                .stop_scan()
                .await
                .map_err(TransportError::from)?;
        }
        Ok(())
    }

    async fn connect(&self, address: BDAddr) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Err(TransportError::ConnectInProgress);
        }

        let peripheral = self
            .devices
            .lock()
            .await
            .get(&address)
            .map(|(peripheral, _)| peripheral.clone())
            .ok_or_else(|| TransportError::DeviceNotFound(address.to_string()))?;

        info!("Connecting to {}", address);
        match timeout(self.connect_timeout, peripheral.connect()).await {
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(TransportError::ConnectTimeout(self.connect_timeout));
            }
            Ok(Err(err)) => {
                let _ = peripheral.disconnect().await;
                return Err(err.into());
            }
            Ok(Ok(())) => {}
        }

        let (data_char, control_char) = match Self::resolve_characteristics(&peripheral).await {
            Ok(resolved) => resolved,
            Err(err) => {
                let _ = peripheral.disconnect().await;
                return Err(err);
            }
        };

        if let Err(err) = peripheral.subscribe(&data_char).await {
            let _ = peripheral.disconnect().await;
            return Err(err.into());
        }

        info!(
            "Connected to {}; telemetry {} control {}",
            address,
            data_char.uuid,
            control_char
                .as_ref()
                .map(|c| c.uuid.to_string())
                .unwrap_or_else(|| "absent".to_string()),
        );

        *link = Some(ActiveLink {
            peripheral,
            data_char,
            control_char,
            forward_task: None,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.teardown().await;
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(TransportError::NotConnected)?;
        let control = link.control_char.as_ref().ok_or_else(|| {
            TransportError::CharacteristicNotFound("no writable characteristic".to_string())
        })?;

        match timeout(
            self.write_deadline,
            link.peripheral
                .write(control, payload, WriteType::WithResponse),
        )
        .await
        {
            Err(_) => Err(TransportError::WriteFailed(format!(
                "write deadline {:?} exceeded",
                self.write_deadline
            ))),
            Ok(Err(err)) => Err(TransportError::WriteFailed(err.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn subscribe(&self) -> Result<Receiver<RawNotification>, TransportError> {
        let mut link = self.link.lock().await;
        let link = link.as_mut().ok_or(TransportError::NotConnected)?;

        let (tx, rx) = channel(NOTIFICATION_CHANNEL_CAPACITY);
        let mut notifications = link
            .peripheral
            .notifications()
            .await
            .map_err(TransportError::from)?;
        let data_uuid = link.data_char.uuid;
        let source_id = link.peripheral.address().to_string();

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != data_uuid {
                    continue;
                }
                let raw = RawNotification {
                    source_id: source_id.clone(),
                    value: notification.value,
                };
                if tx.send(raw).await.is_err() {
                    break;
                }
            }
            debug!("Notification forwarder stopped");
        });

        if let Some(previous) = link.forward_task.replace(task) {
            previous.abort();
        }
        Ok(rx)
    }
}
