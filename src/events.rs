//! Feed event definitions
//!
//! Every significant marketplace action becomes a `FeedEvent` that is
//! pushed to WebSocket subscribers in real time, retained in the backlog
//! for ribbon reads, and folded into the per-cell heat statistics.
//!
//! Events are immutable once created. The ordering key is
//! `(created_at, event_id)`; UUID v7 event ids break timestamp ties.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geo::Cell;
use crate::ids::{EntityId, EventId};

/// Classification of a feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedEventType {
    /// New item posted
    NewListing,
    /// Price reduced on an existing listing
    PriceDrop,
    /// Item sold nearby
    ItemSold,
    /// New trade proposed
    TradeRequest,
    /// Trade completed
    TradeCompleted,
    /// Shop restock alert
    Restock,
}

impl FeedEventType {
    /// Wire/label form, matching the serialized representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedEventType::NewListing => "NEW_LISTING",
            FeedEventType::PriceDrop => "PRICE_DROP",
            FeedEventType::ItemSold => "ITEM_SOLD",
            FeedEventType::TradeRequest => "TRADE_REQUEST",
            FeedEventType::TradeCompleted => "TRADE_COMPLETED",
            FeedEventType::Restock => "RESTOCK",
        }
    }

    /// Parse the wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW_LISTING" => Some(FeedEventType::NewListing),
            "PRICE_DROP" => Some(FeedEventType::PriceDrop),
            "ITEM_SOLD" => Some(FeedEventType::ItemSold),
            "TRADE_REQUEST" => Some(FeedEventType::TradeRequest),
            "TRADE_COMPLETED" => Some(FeedEventType::TradeCompleted),
            "RESTOCK" => Some(FeedEventType::Restock),
            _ => None,
        }
    }
}

/// Kind of marketplace entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Listing,
    Store,
    Trade,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Listing => "listing",
            EntityType::Store => "store",
            EntityType::Trade => "trade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "listing" => Some(EntityType::Listing),
            "store" => Some(EntityType::Store),
            "trade" => Some(EntityType::Trade),
            _ => None,
        }
    }
}

/// Event-specific key/value payload, ordered for deterministic output.
pub type EventPayload = BTreeMap<String, Value>;

/// A validated, immutable feed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Unique event identifier (UUID v7).
    pub event_id: EventId,
    /// Event classification.
    pub event_type: FeedEventType,
    /// Kind of entity this event refers to.
    pub entity_type: EntityType,
    /// Identifier of the referenced entity.
    pub entity_id: EntityId,
    /// Cell the event occurred in.
    pub cell: Cell,
    /// Type-specific payload.
    pub payload: EventPayload,
    /// Pre-rendered activity-ribbon line.
    pub display_text: String,
    /// Creation timestamp, Unix milliseconds.
    pub created_at: i64,
}

impl FeedEvent {
    /// The ordering key: `(created_at, event_id)`.
    pub fn ordering_key(&self) -> (i64, EventId) {
        (self.created_at, self.event_id)
    }

    /// Current time as a Unix-millisecond timestamp.
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Payload value as a string slice, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Payload value as an f64, if present.
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_f64())
    }
}

impl Eq for FeedEvent {}

/// Events order by creation time, event id breaking ties.
impl Ord for FeedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ordering_key().cmp(&other.ordering_key())
    }
}

impl PartialOrd for FeedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_event(created_at: i64) -> FeedEvent {
        let mut payload = EventPayload::new();
        payload.insert("title".to_string(), json!("Jordan 4 Bred"));
        payload.insert("price".to_string(), json!(250.0));

        FeedEvent {
            event_id: EventId::new(),
            event_type: FeedEventType::NewListing,
            entity_type: EntityType::Listing,
            entity_id: EntityId::new(),
            cell: Cell::parse("drt2z0").unwrap(),
            payload,
            display_text: "New listing: Jordan 4 Bred - $250".to_string(),
            created_at,
        }
    }

    #[test]
    fn test_event_type_roundtrip() {
        for t in [
            FeedEventType::NewListing,
            FeedEventType::PriceDrop,
            FeedEventType::ItemSold,
            FeedEventType::TradeRequest,
            FeedEventType::TradeCompleted,
            FeedEventType::Restock,
        ] {
            assert_eq!(FeedEventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(FeedEventType::parse("FLASH_SALE"), None);
    }

    #[test]
    fn test_event_type_wire_form() {
        let json = serde_json::to_string(&FeedEventType::NewListing).unwrap();
        assert_eq!(json, "\"NEW_LISTING\"");
    }

    #[test]
    fn test_ordering_by_timestamp_then_id() {
        let e1 = make_event(1_700_000_000_000);
        let e2 = make_event(1_700_000_000_001);
        assert!(e1 < e2);

        // Same timestamp: the later (v7) id orders last
        let a = make_event(1_700_000_000_000);
        let b = make_event(1_700_000_000_000);
        if a.event_id < b.event_id {
            assert!(a < b);
        } else {
            assert!(b < a);
        }
    }

    #[test]
    fn test_events_sort_into_creation_order() {
        let e1 = make_event(3);
        let e2 = make_event(1);
        let e3 = make_event(2);

        let mut events = vec![e1, e2, e3];
        events.sort();
        assert_eq!(events[0].created_at, 1);
        assert_eq!(events[1].created_at, 2);
        assert_eq!(events[2].created_at, 3);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let event = make_event(1_700_000_000_000);
        let json = serde_json::to_string(&event).unwrap();
        let back: FeedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_payload_accessors() {
        let event = make_event(1);
        assert_eq!(event.payload_str("title"), Some("Jordan 4 Bred"));
        assert_eq!(event.payload_f64("price"), Some(250.0));
        assert_eq!(event.payload_str("missing"), None);
    }
}
