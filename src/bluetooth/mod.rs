//! Radio access for the smart bottle: discovery, the single connected link
//! and the raw notification stream the rest of the crate consumes.

pub mod constants;

mod ble;
mod transport;

pub use ble::BleTransport;
pub use transport::{PeripheralHandle, RawNotification, Transport};
