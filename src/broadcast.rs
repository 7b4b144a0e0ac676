//! Event fan-out
//!
//! Pushes each validated event to every session whose coverage includes
//! the event's cell. The frame is serialized once per event; delivery to
//! each session goes through its bounded queue, so one slow subscriber
//! never blocks ingest or anyone else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::events::FeedEvent;
use crate::protocol::ServerMessage;
use crate::session::{DeliveryOutcome, SessionRegistry};

#[derive(Debug, Default)]
struct BroadcastStats {
    delivered: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
}

/// Fans validated events out to covering sessions.
pub struct FeedBroadcaster {
    registry: Arc<SessionRegistry>,
    stats: BroadcastStats,
}

impl FeedBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: BroadcastStats::default(),
        }
    }

    /// Deliver an event to every covering session. Returns how many
    /// sessions the event was enqueued for.
    pub fn broadcast(&self, event: &FeedEvent) -> usize {
        let sessions = self.registry.sessions_for_cell(&event.cell);
        if sessions.is_empty() {
            return 0;
        }

        let frame = match serde_json::to_string(&ServerMessage::FeedEvent {
            data: event.clone(),
        }) {
            Ok(frame) => frame,
            Err(err) => {
                error!(event_id = %event.event_id, error = %err, "frame serialization failed");
                return 0;
            }
        };

        let key = event.ordering_key();
        let mut delivered = 0;
        for session in sessions {
            match session.offer_event(key, &frame) {
                DeliveryOutcome::Delivered => {
                    delivered += 1;
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::Duplicate => {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::QueueFull => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        session_id = %session.session_id,
                        event_id = %event.event_id,
                        "queue full, event dropped for session"
                    );
                }
                DeliveryOutcome::Closed => {}
            }
        }

        debug!(
            event_id = %event.event_id,
            cell = %event.cell,
            delivered,
            "event broadcast"
        );
        delivered
    }

    pub fn total_delivered(&self) -> u64 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}
