use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// One-way outbound port for lifecycle events. The engine calls `publish`
/// after a transition has committed and never waits on delivery — the ledger
/// is authoritative, notifications are best-effort.
pub trait EventSink: Send + Sync {
    fn publish(&self, vehicle_id: Ulid, event: &Event);
}

/// Broadcast hub: per-vehicle channels feeding whoever cares about a
/// vehicle's calendar (notification pipelines, dashboards).
pub struct BroadcastHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a vehicle. Creates the channel if needed.
    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(vehicle_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Remove a channel (e.g. when a vehicle is deleted).
    pub fn remove(&self, vehicle_id: &Ulid) {
        self.channels.remove(vehicle_id);
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastHub {
    /// No-op if nobody is listening; a full channel drops the event for the
    /// lagging subscriber only. Either way the booking that triggered it has
    /// already committed.
    fn publish(&self, vehicle_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&vehicle_id)
            && sender.send(event.clone()).is_err() {
                tracing::debug!("event for vehicle {vehicle_id} had no listeners");
            }
    }
}

/// Sink that drops everything. For tests and tooling that don't care.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _vehicle_id: Ulid, _event: &Event) {}
}

pub fn null_sink() -> Arc<dyn EventSink> {
    Arc::new(NullSink)
}
