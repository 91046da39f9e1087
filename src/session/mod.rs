//! Session orchestration: the connection state machine, observer fan-out
//! and the control-command surface.

mod commands;
mod coordinator;
mod events;

pub use commands::{CalibrationAction, Command};
pub use coordinator::{ConnectionState, ConsumptionSink, SessionCoordinator, SubjectId};
pub use events::{
    receiver_to_stream, EventBroker, EventFilter, EventType, LevelReading, LevelSource,
    SessionEvent, SubscriberId, SubscriptionHandle,
};
