//! GATT identifiers and radio timing constants for the smart bottle.

use std::time::Duration;

use uuid::Uuid;

/// The UUID of the BLE service advertised by the bottle firmware.
pub const BOTTLE_SERVICE: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";

/// The UUID of the characteristic that pushes telemetry notifications.
pub const TELEMETRY_CHARACTERISTIC: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";

/// The UUID of the characteristic that accepts JSON control envelopes.
pub const CONTROL_CHARACTERISTIC: &str = "beb5483f-36e1-4688-b7f5-ea07361b26a8";

/// Advertised-name fallback: some platforms strip the service list from
/// advertisements, so any peripheral whose name starts with this prefix is
/// accepted as a candidate bottle.
pub const DEVICE_NAME_PREFIX: &str = "SmartBottle";

/// Default scan deadline.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Default fail-fast connection deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a write to the control characteristic may take.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(2);

/// How often an in-progress scan re-checks for an external stop request.
pub const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn bottle_service_uuid() -> Uuid {
    Uuid::parse_str(BOTTLE_SERVICE).unwrap()
}

pub fn telemetry_characteristic_uuid() -> Uuid {
    Uuid::parse_str(TELEMETRY_CHARACTERISTIC).unwrap()
}

pub fn control_characteristic_uuid() -> Uuid {
    Uuid::parse_str(CONTROL_CHARACTERISTIC).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants_parse() {
        assert_ne!(bottle_service_uuid(), telemetry_characteristic_uuid());
        assert_ne!(telemetry_characteristic_uuid(), control_characteristic_uuid());
    }
}
