//! The transport seam between the session coordinator and the radio.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use btleplug::api::BDAddr;
use tokio::sync::mpsc::Receiver;

use crate::error::TransportError;

/// A peripheral observed during discovery.
///
/// Handles are ephemeral: they are created per discovery event and are only
/// meaningful for the scan session that produced them. The address is the
/// stable identity used to connect.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralHandle {
    /// Platform address of the peripheral.
    pub address: BDAddr,
    /// Advertised name, if the advertisement carried one.
    pub name: Option<String>,
    /// Signal strength at last sighting.
    pub rssi: Option<i16>,
    /// When the peripheral was last seen by the scanner.
    pub last_seen: Instant,
}

impl PeripheralHandle {
    pub fn new(address: BDAddr, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            address,
            name,
            rssi,
            last_seen: Instant::now(),
        }
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}{})",
            self.address,
            self.name.as_deref().unwrap_or("unnamed"),
            match self.rssi {
                Some(rssi) => format!(", {} dBm", rssi),
                None => String::new(),
            }
        )
    }
}

/// One raw notification payload as delivered by the radio stack. Each
/// notification is exactly one wire payload; there is no further framing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    /// Address of the peripheral that produced the payload.
    pub source_id: String,
    /// The payload bytes, UTF-8 JSON or a bare ASCII integer.
    pub value: Vec<u8>,
}

/// Abstract radio: discovery, a single connected link, structured writes and
/// a push stream of raw notification payloads.
///
/// The production implementation is [`super::BleTransport`]; tests drive the
/// coordinator against a fake.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for candidate bottles until `timeout` elapses and return the
    /// discovered set. Idempotent: a scan issued while one is already
    /// running returns the in-progress result set instead of erroring.
    async fn scan(&self, timeout: Duration) -> Result<Vec<PeripheralHandle>, TransportError>;

    /// Snapshot of the devices discovered so far in the current (or most
    /// recent) scan session.
    async fn devices(&self) -> Vec<PeripheralHandle>;

    /// Request an early end to an in-progress scan. Safe to call when no
    /// scan is running.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Establish a link to a previously discovered peripheral. Fails fast on
    /// its deadline and leaves the transport idle on any failure, never
    /// half-connected.
    async fn connect(&self, address: BDAddr) -> Result<(), TransportError>;

    /// Tear down the link. Always routes through the single cleanup path;
    /// safe to call when not connected.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Write one payload to the control characteristic.
    async fn write(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to raw notification payloads from the telemetry
    /// characteristic. The stream ends when the link is torn down.
    async fn subscribe(&self) -> Result<Receiver<RawNotification>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display_named() {
        let handle = PeripheralHandle::new(
            BDAddr::from([0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]),
            Some("SmartBottle-01".to_string()),
            Some(-62),
        );
        let rendered = handle.to_string();
        assert!(rendered.contains("SmartBottle-01"));
        assert!(rendered.contains("-62 dBm"));
    }

    #[test]
    fn test_handle_display_unnamed() {
        let handle = PeripheralHandle::new(BDAddr::default(), None, None);
        assert!(handle.to_string().contains("unnamed"));
    }
}
