//! Event ingest pipeline
//!
//! Accepts raw event submissions from the marketplace CRUD layer,
//! validates them against the per-type payload rules, stamps ids and
//! timestamps, resolves the cell from coordinates when one was not
//! provided, and renders the ribbon display line. Recently-seen event
//! ids are deduplicated within a bounded window so retried submissions
//! are accepted idempotently.
//!
//! Validation failures are scoped to the single offending event; the
//! pipeline never stops on bad input.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::InvalidEvent;
use crate::events::{EntityType, EventPayload, FeedEvent, FeedEventType};
use crate::geo::{cell_of, Cell};
use crate::ids::{EntityId, EventId};

/// Raw event submission, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Option<EntityId>,
    /// Pre-assigned id, for idempotent retries. Stamped when absent.
    pub event_id: Option<EventId>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// Pre-resolved cell, alternative to coordinates.
    pub cell: Option<String>,
    #[serde(default)]
    pub payload: EventPayload,
    /// Unix milliseconds. Stamped with the current time when absent.
    pub created_at: Option<i64>,
}

/// Ingest tuning.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// How many recent event ids to remember for deduplication.
    pub dedup_window: usize,
    /// Geohash precision for cell resolution.
    pub cell_precision: u8,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window: 10_000,
            cell_precision: 6,
        }
    }
}

/// Outcome of a single submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Duplicate,
}

#[derive(Debug, Default)]
struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
}

/// Sliding-window event id dedup.
struct DedupWindow {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true if the id was already in the window.
    fn check_and_insert(&mut self, id: EventId) -> bool {
        if self.seen.contains(&id) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id);
        self.order.push_back(id);
        false
    }
}

/// Validates and normalizes incoming events.
pub struct EventIngester {
    config: IngestConfig,
    dedup: Mutex<DedupWindow>,
    stats: IngestStats,
}

impl EventIngester {
    pub fn new(config: IngestConfig) -> Self {
        let dedup = Mutex::new(DedupWindow::new(config.dedup_window));
        Self {
            config,
            dedup,
            stats: IngestStats::default(),
        }
    }

    /// Validate a raw submission into a `FeedEvent`.
    ///
    /// Returns `Ok(None)` for duplicates of a recently-accepted event id.
    pub fn ingest(&self, raw: IncomingEvent) -> Result<Option<FeedEvent>, InvalidEvent> {
        match self.validate(raw) {
            Ok(Some(event)) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_id = %event.event_id,
                    event_type = event.event_type.as_str(),
                    cell = %event.cell,
                    "event accepted"
                );
                Ok(Some(event))
            }
            Ok(None) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(err) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "event rejected");
                Err(err)
            }
        }
    }

    fn validate(&self, raw: IncomingEvent) -> Result<Option<FeedEvent>, InvalidEvent> {
        let event_type = FeedEventType::parse(&raw.event_type)
            .ok_or_else(|| InvalidEvent::UnknownEventType(raw.event_type.clone()))?;
        let entity_type = EntityType::parse(&raw.entity_type)
            .ok_or_else(|| InvalidEvent::UnknownEntityType(raw.entity_type.clone()))?;
        let entity_id = raw.entity_id.ok_or(InvalidEvent::MissingField("entity_id"))?;

        let cell = self.resolve_cell(&raw)?;

        let mut payload = raw.payload;
        check_payload(event_type, &mut payload)?;
        let display_text = render_display_text(event_type, &payload);

        // Dedup only once the event is known-valid, so a corrected retry
        // of a rejected submission is not mistaken for a duplicate.
        let event_id = raw.event_id.unwrap_or_default();
        if let Ok(mut dedup) = self.dedup.lock() {
            if dedup.check_and_insert(event_id) {
                debug!(event_id = %event_id, "duplicate event id ignored");
                return Ok(None);
            }
        }

        Ok(Some(FeedEvent {
            event_id,
            event_type,
            entity_type,
            entity_id,
            cell,
            payload,
            display_text,
            created_at: raw.created_at.unwrap_or_else(FeedEvent::now_millis),
        }))
    }

    fn resolve_cell(&self, raw: &IncomingEvent) -> Result<Cell, InvalidEvent> {
        if let Some(cell) = &raw.cell {
            return Ok(Cell::parse(cell)?);
        }
        match (raw.lat, raw.lng) {
            (Some(lat), Some(lng)) => Ok(cell_of(lat, lng, self.config.cell_precision)?),
            _ => Err(InvalidEvent::MissingLocation),
        }
    }

    pub fn accepted(&self) -> u64 {
        self.stats.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.stats.rejected.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.stats.duplicates.load(Ordering::Relaxed)
    }
}

fn require_key(
    event_type: FeedEventType,
    payload: &EventPayload,
    key: &'static str,
) -> Result<(), InvalidEvent> {
    if payload.contains_key(key) {
        Ok(())
    } else {
        Err(InvalidEvent::MissingPayloadKey {
            event_type: event_type.as_str(),
            key,
        })
    }
}

fn require_price(payload: &EventPayload, key: &'static str) -> Result<f64, InvalidEvent> {
    let value = payload
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| InvalidEvent::InvalidPayloadValue {
            key,
            reason: "expected a number".to_string(),
        })?;
    if value <= 0.0 || !value.is_finite() {
        return Err(InvalidEvent::InvalidPayloadValue {
            key,
            reason: format!("expected a positive price, got {value}"),
        });
    }
    Ok(value)
}

/// Per-type payload validation. `PRICE_DROP` also gets `drop_percent`
/// injected, rounded to one decimal.
fn check_payload(
    event_type: FeedEventType,
    payload: &mut EventPayload,
) -> Result<(), InvalidEvent> {
    match event_type {
        FeedEventType::NewListing | FeedEventType::ItemSold => {
            require_key(event_type, payload, "title")?;
        }
        FeedEventType::TradeRequest | FeedEventType::TradeCompleted => {
            require_key(event_type, payload, "title")?;
        }
        FeedEventType::PriceDrop => {
            require_key(event_type, payload, "title")?;
            require_key(event_type, payload, "old_price")?;
            require_key(event_type, payload, "new_price")?;
            let old_price = require_price(payload, "old_price")?;
            let new_price = require_price(payload, "new_price")?;
            if new_price >= old_price {
                return Err(InvalidEvent::InvalidPayloadValue {
                    key: "new_price",
                    reason: format!("must be below old_price ({old_price})"),
                });
            }
            let drop_percent = ((old_price - new_price) / old_price * 1000.0).round() / 10.0;
            payload.insert("drop_percent".to_string(), json!(drop_percent));
        }
        FeedEventType::Restock => {
            require_key(event_type, payload, "store_name")?;
            require_key(event_type, payload, "product_name")?;
        }
    }
    Ok(())
}

fn payload_str<'a>(payload: &'a EventPayload, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or("")
}

fn render_display_text(event_type: FeedEventType, payload: &EventPayload) -> String {
    match event_type {
        FeedEventType::NewListing => {
            let title = payload_str(payload, "title");
            match payload.get("price").and_then(Value::as_f64) {
                Some(price) => format!("New listing: {title} - ${price:.0}"),
                None => format!("New listing: {title}"),
            }
        }
        FeedEventType::PriceDrop => {
            let title = payload_str(payload, "title");
            let new_price = payload.get("new_price").and_then(Value::as_f64).unwrap_or(0.0);
            let drop = payload.get("drop_percent").and_then(Value::as_f64).unwrap_or(0.0);
            format!("Price drop: {title} now ${new_price:.0} ({drop}% off)")
        }
        FeedEventType::ItemSold => {
            format!("Just sold: {}", payload_str(payload, "title"))
        }
        FeedEventType::TradeRequest => {
            format!("Trade requested: {}", payload_str(payload, "title"))
        }
        FeedEventType::TradeCompleted => {
            format!("Trade completed: {}", payload_str(payload, "title"))
        }
        FeedEventType::Restock => {
            format!(
                "Restock: {} at {}",
                payload_str(payload, "product_name"),
                payload_str(payload, "store_name"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingester() -> EventIngester {
        EventIngester::new(IngestConfig::default())
    }

    fn listing_submission() -> IncomingEvent {
        IncomingEvent {
            event_type: "NEW_LISTING".to_string(),
            entity_type: "listing".to_string(),
            entity_id: Some(EntityId::new()),
            event_id: None,
            lat: Some(42.3601),
            lng: Some(-71.0589),
            cell: None,
            payload: [
                ("title".to_string(), json!("Jordan 4 Bred")),
                ("price".to_string(), json!(250.0)),
            ]
            .into_iter()
            .collect(),
            created_at: None,
        }
    }

    #[test]
    fn test_accepts_valid_listing() {
        let ing = ingester();
        let event = ing.ingest(listing_submission()).unwrap().unwrap();
        assert_eq!(event.event_type, FeedEventType::NewListing);
        assert!(event.cell.as_str().starts_with("drt"));
        assert_eq!(event.display_text, "New listing: Jordan 4 Bred - $250");
        assert!(event.created_at > 0);
        assert_eq!(ing.accepted(), 1);
    }

    #[test]
    fn test_rejects_unknown_event_type() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.event_type = "FLASH_SALE".to_string();
        let err = ing.ingest(raw).unwrap_err();
        assert!(matches!(err, InvalidEvent::UnknownEventType(_)));
        assert_eq!(ing.rejected(), 1);
    }

    #[test]
    fn test_rejects_missing_location() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.lat = None;
        raw.lng = None;
        let err = ing.ingest(raw).unwrap_err();
        assert_eq!(err, InvalidEvent::MissingLocation);
    }

    #[test]
    fn test_rejects_out_of_range_latitude() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.lat = Some(95.0);
        assert!(ing.ingest(raw).is_err());
    }

    #[test]
    fn test_accepts_explicit_cell() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.lat = None;
        raw.lng = None;
        raw.cell = Some("drt2z0".to_string());
        let event = ing.ingest(raw).unwrap().unwrap();
        assert_eq!(event.cell.as_str(), "drt2z0");
    }

    #[test]
    fn test_price_drop_requires_prices_and_injects_percent() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.event_type = "PRICE_DROP".to_string();
        raw.payload.insert("old_price".to_string(), json!(200.0));

        // missing new_price
        let err = ing.ingest(raw.clone()).unwrap_err();
        assert!(matches!(err, InvalidEvent::MissingPayloadKey { key: "new_price", .. }));

        raw.payload.insert("new_price".to_string(), json!(150.0));
        let event = ing.ingest(raw).unwrap().unwrap();
        assert_eq!(event.payload_f64("drop_percent"), Some(25.0));
        assert_eq!(
            event.display_text,
            "Price drop: Jordan 4 Bred now $150 (25% off)"
        );
    }

    #[test]
    fn test_price_drop_rejects_increase() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.event_type = "PRICE_DROP".to_string();
        raw.payload.insert("old_price".to_string(), json!(100.0));
        raw.payload.insert("new_price".to_string(), json!(120.0));
        let err = ing.ingest(raw).unwrap_err();
        assert!(matches!(err, InvalidEvent::InvalidPayloadValue { key: "new_price", .. }));
    }

    #[test]
    fn test_restock_payload_keys() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.event_type = "RESTOCK".to_string();
        raw.entity_type = "store".to_string();
        raw.payload.clear();
        raw.payload.insert("store_name".to_string(), json!("Kick Spot"));

        let err = ing.ingest(raw.clone()).unwrap_err();
        assert!(matches!(err, InvalidEvent::MissingPayloadKey { key: "product_name", .. }));

        raw.payload.insert("product_name".to_string(), json!("Dunk Low Panda"));
        let event = ing.ingest(raw).unwrap().unwrap();
        assert_eq!(event.display_text, "Restock: Dunk Low Panda at Kick Spot");
    }

    #[test]
    fn test_duplicate_event_id_is_dropped() {
        let ing = ingester();
        let mut raw = listing_submission();
        raw.event_id = Some(EventId::new());

        assert!(ing.ingest(raw.clone()).unwrap().is_some());
        assert!(ing.ingest(raw).unwrap().is_none());
        assert_eq!(ing.accepted(), 1);
        assert_eq!(ing.duplicates(), 1);
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let ing = EventIngester::new(IngestConfig {
            dedup_window: 2,
            cell_precision: 6,
        });
        let first = EventId::new();

        for id in [first, EventId::new(), EventId::new()] {
            let mut raw = listing_submission();
            raw.event_id = Some(id);
            assert!(ing.ingest(raw).unwrap().is_some());
        }

        // first id was evicted from the window, so it is accepted again
        let mut raw = listing_submission();
        raw.event_id = Some(first);
        assert!(ing.ingest(raw).unwrap().is_some());
    }
}
