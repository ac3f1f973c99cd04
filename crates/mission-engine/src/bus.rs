use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::model::{Event, EventKind, MissionId};

const MISSION_CHANNEL_CAPACITY: usize = 2048;

/// Per-mission event fan-out. Each mission gets its own broadcast
/// channel rather than one global firehose, so a slow subscriber on
/// one mission cannot cause another mission's subscribers to drop
/// events (spec.md §4.6: "each receives an independent view").
///
/// Grounded on `tandem-core::event_bus::EventBus`, generalized from a
/// single global channel to one channel per mission.
pub struct MissionEventBus {
    channels: RwLock<HashMap<MissionId, broadcast::Sender<Event>>>,
}

impl MissionEventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn sender(&self, mission_id: MissionId) -> broadcast::Sender<Event> {
        if let Some(tx) = self.channels.read().await.get(&mission_id) {
            return tx.clone();
        }
        let mut guard = self.channels.write().await;
        guard
            .entry(mission_id)
            .or_insert_with(|| broadcast::channel(MISSION_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publishes an event to all current subscribers of its mission.
    /// Never blocks and never fails if there are no subscribers yet —
    /// matches `broadcast::Sender::send`'s semantics of dropping the
    /// value when the channel has no receivers.
    pub async fn publish(&self, mission_id: MissionId, event: Event) {
        let tx = self.sender(mission_id).await;
        let _ = tx.send(event);
    }

    /// Subscribes to a mission's event stream. Lazy, potentially
    /// infinite, finite-buffered: if the subscriber falls behind, the
    /// oldest events are dropped and a GAP marker is surfaced so the
    /// caller can resynchronize via the Mission Store's replay API.
    pub async fn subscribe(&self, mission_id: MissionId) -> MissionEventStream {
        let rx = self.sender(mission_id).await.subscribe();
        MissionEventStream { mission_id, inner: rx }
    }
}

impl Default for MissionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MissionEventStream {
    mission_id: MissionId,
    inner: broadcast::Receiver<Event>,
}

impl MissionEventStream {
    /// Receives the next event, or a synthesized GAP marker if events
    /// were dropped because this subscriber fell behind. Returns `None`
    /// once the mission's channel is closed (no more writers).
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.inner.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(Event {
                        mission_id: self.mission_id,
                        sequence_number: 0,
                        timestamp: Utc::now(),
                        event_kind: EventKind::Gap,
                        payload: serde_json::json!({ "skipped": skipped }),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MissionId;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = MissionEventBus::new();
        let mission_id = MissionId::new();
        let mut stream = bus.subscribe(mission_id).await;

        bus.publish(
            mission_id,
            Event {
                mission_id,
                sequence_number: 1,
                timestamp: Utc::now(),
                event_kind: EventKind::MissionStart,
                payload: serde_json::json!({}),
            },
        )
        .await;

        let received = stream.recv().await.unwrap();
        assert_eq!(received.sequence_number, 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_sees_gap_marker() {
        let bus = MissionEventBus::new();
        let mission_id = MissionId::new();
        let mut stream = bus.subscribe(mission_id).await;

        for i in 1..=(MISSION_CHANNEL_CAPACITY as u64 + 5) {
            bus.publish(
                mission_id,
                Event {
                    mission_id,
                    sequence_number: i,
                    timestamp: Utc::now(),
                    event_kind: EventKind::Progress,
                    payload: serde_json::json!({}),
                },
            )
            .await;
        }

        let first = stream.recv().await.unwrap();
        assert!(matches!(first.event_kind, EventKind::Gap));
    }
}
