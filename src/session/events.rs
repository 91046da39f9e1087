//! Session event fan-out: a subscribe/unsubscribe registry that pushes
//! readings, connection transitions and device-list updates to observers.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::Stream;
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::bluetooth::PeripheralHandle;
use crate::session::ConnectionState;
use crate::telemetry::SensorReading;

/// Capacity of each subscriber's channel. A subscriber that falls this far
/// behind starts losing events rather than stalling the publisher.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// Where a published level figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSource {
    /// Computed from the subject's calibration. Trustworthy.
    Calibrated,
    /// The peripheral's self-reported percentage; its empty/full assumptions
    /// are unknown, so treat as low confidence.
    DeviceReported,
    /// Distance was below the validity floor, level forced to zero.
    OutOfRange,
    /// No calibration and no self-reported percentage were available.
    Unknown,
}

impl fmt::Display for LevelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Calibrated => "calibrated",
            Self::DeviceReported => "device-reported",
            Self::OutOfRange => "out-of-range",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// A computed fill level attached to a reading.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelReading {
    pub level_pct: f64,
    /// Only present when a calibration supplied the bottle capacity.
    pub volume_ml: Option<f64>,
    pub source: LevelSource,
}

/// Events published by the session coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A decoded reading together with its computed level.
    Reading {
        reading: SensorReading,
        level: LevelReading,
    },
    /// The connection state machine moved.
    ConnectionChanged(ConnectionState),
    /// The discovered-device list grew or was reset.
    DevicesUpdated(Vec<PeripheralHandle>),
}

/// Discriminant of a [`SessionEvent`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Reading,
    ConnectionChanged,
    DevicesUpdated,
}

impl SessionEvent {
    pub fn get_type(&self) -> EventType {
        match self {
            Self::Reading { .. } => EventType::Reading,
            Self::ConnectionChanged(_) => EventType::ConnectionChanged,
            Self::DevicesUpdated(_) => EventType::DevicesUpdated,
        }
    }
}

/// Defines which events a subscriber is interested in.
pub enum EventFilter {
    /// Accept every event.
    All,
    /// Only the listed event types.
    EventTypes(Vec<EventType>),
    /// Custom predicate.
    Custom(Box<dyn Fn(&SessionEvent) -> bool + Send + Sync + 'static>),
}

impl EventFilter {
    pub fn all() -> Self {
        Self::All
    }

    pub fn event_types(types: Vec<EventType>) -> Self {
        Self::EventTypes(types)
    }

    pub fn readings_only() -> Self {
        Self::event_types(vec![EventType::Reading])
    }

    pub fn connection_only() -> Self {
        Self::event_types(vec![EventType::ConnectionChanged])
    }

    pub fn devices_only() -> Self {
        Self::event_types(vec![EventType::DevicesUpdated])
    }

    pub fn custom<F>(filter_fn: F) -> Self
    where
        F: Fn(&SessionEvent) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Box::new(filter_fn))
    }

    pub fn matches(&self, event: &SessionEvent) -> bool {
        match self {
            Self::All => true,
            Self::EventTypes(types) => types.contains(&event.get_type()),
            Self::Custom(filter_fn) => filter_fn(event),
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "EventFilter::All"),
            Self::EventTypes(types) => write!(f, "EventFilter::EventTypes({:?})", types),
            Self::Custom(_) => write!(f, "EventFilter::Custom(<function>)"),
        }
    }
}

pub type SubscriberId = u32;

struct Subscriber {
    id: SubscriberId,
    sender: Sender<SessionEvent>,
    filter: EventFilter,
}

struct BrokerInner {
    next_subscriber_id: SubscriberId,
    subscribers: Vec<Subscriber>,
}

/// Fan-out registry. Publishing walks the live subscriber list under a
/// short lock and uses `try_send`, so one slow or dead observer can drop
/// its own events but never block delivery to the others.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                next_subscriber_id: 1,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Register an observer. The handle cancels the subscription; dropping
    /// the receiver also removes it lazily on the next publish.
    pub fn subscribe(&self, filter: EventFilter) -> (SubscriptionHandle, Receiver<SessionEvent>) {
        let (tx, rx) = channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            sender: tx,
            filter,
        });
        (
            SubscriptionHandle {
                id,
                inner: Arc::downgrade(&self.inner),
            },
            rx,
        )
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.lock().unwrap().subscribers.retain(|s| s.id != id);
    }

    /// Deliver an event to every matching subscriber. Subscribers whose
    /// receiver has been dropped are pruned here.
    pub fn publish(&self, event: SessionEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|subscriber| {
            if !subscriber.filter.matches(&event) {
                return true;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                    log::debug!("Subscriber {} is lagging, event dropped", subscriber.id);
                    true
                }
                Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Subscriber {} went away, pruning", subscriber.id);
                    false
                }
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handle for one subscription. Safe to cancel while a publish
/// is in flight; already-queued events stay in the receiver.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    inner: Weak<Mutex<BrokerInner>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn cancel(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().unwrap().subscribers.retain(|s| s.id != self.id);
        }
    }
}

/// Adapt an event receiver into a `Stream` for `tokio_stream`/`futures`
/// combinators.
pub fn receiver_to_stream(mut rx: Receiver<SessionEvent>) -> impl Stream<Item = SessionEvent> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield event;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reading_event(distance_mm: f64) -> SessionEvent {
        SessionEvent::Reading {
            reading: SensorReading::new(distance_mm, None, "AA:BB:CC:DD:EE:FF"),
            level: LevelReading {
                level_pct: 50.0,
                volume_ml: Some(375.0),
                source: LevelSource::Calibrated,
            },
        }
    }

    #[test]
    fn test_filter_all_matches_everything() {
        let filter = EventFilter::all();
        assert!(filter.matches(&reading_event(80.0)));
        assert!(filter.matches(&SessionEvent::ConnectionChanged(ConnectionState::Idle)));
        assert!(filter.matches(&SessionEvent::DevicesUpdated(Vec::new())));
    }

    #[test]
    fn test_filter_readings_only() {
        let filter = EventFilter::readings_only();
        assert!(filter.matches(&reading_event(80.0)));
        assert!(!filter.matches(&SessionEvent::ConnectionChanged(ConnectionState::Idle)));
        assert!(!filter.matches(&SessionEvent::DevicesUpdated(Vec::new())));
    }

    #[test]
    fn test_filter_custom_low_level() {
        let filter = EventFilter::custom(|event| {
            matches!(
                event,
                SessionEvent::Reading { level, .. } if level.level_pct < 20.0
            )
        });
        let mut low = reading_event(80.0);
        if let SessionEvent::Reading { level, .. } = &mut low {
            level.level_pct = 10.0;
        }
        assert!(filter.matches(&low));
        assert!(!filter.matches(&reading_event(80.0)));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = EventBroker::new();
        let (_h1, mut readings) = broker.subscribe(EventFilter::readings_only());
        let (_h2, mut connection) = broker.subscribe(EventFilter::connection_only());

        broker.publish(reading_event(80.0));
        broker.publish(SessionEvent::ConnectionChanged(ConnectionState::Idle));

        assert_eq!(readings.recv().await.unwrap().get_type(), EventType::Reading);
        assert_eq!(
            connection.recv().await.unwrap().get_type(),
            EventType::ConnectionChanged
        );
        assert!(readings.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let broker = EventBroker::new();
        let (handle, mut rx) = broker.subscribe(EventFilter::all());
        broker.publish(reading_event(80.0));
        handle.cancel();
        broker.publish(reading_event(81.0));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_publish() {
        let broker = EventBroker::new();
        let (_handle, rx) = broker.subscribe(EventFilter::all());
        drop(rx);
        assert_eq!(broker.subscriber_count(), 1);
        broker.publish(reading_event(80.0));
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let broker = EventBroker::new();
        let (_h1, _slow) = broker.subscribe(EventFilter::all());
        let (_h2, mut fast) = broker.subscribe(EventFilter::all());

        for i in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 10) {
            broker.publish(reading_event(i as f64));
        }
        // the slow subscriber saturated its channel; the fast one still
        // receives, and the publisher never blocked
        assert!(fast.recv().await.is_some());
        assert_eq!(broker.subscriber_count(), 2);
    }
}
