//! Per-cell event backlog
//!
//! Bounded FIFO ring of the most recent events per cell, serving the
//! activity-ribbon reads and reconnect catch-up. When the ring is full
//! the oldest event is evicted; missed events older than the ring are
//! simply gone, which at-most-once delivery already permits.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::events::FeedEvent;
use crate::geo::Cell;

pub const DEFAULT_BACKLOG_CAPACITY: usize = 50;

/// Ring of recent events for one cell, oldest first.
#[derive(Debug)]
struct CellBacklog {
    events: VecDeque<FeedEvent>,
    capacity: usize,
}

impl CellBacklog {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: FeedEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Result of a ribbon read.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BacklogPage {
    /// Recency-descending events.
    pub events: Vec<FeedEvent>,
    /// True when more events matched than the limit returned.
    pub has_more: bool,
}

/// Backlogs for all cells.
pub struct EventBacklog {
    cells: DashMap<Cell, CellBacklog>,
    capacity: usize,
}

impl EventBacklog {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: DashMap::new(),
            capacity,
        }
    }

    /// Append an event to its cell's ring.
    pub fn push(&self, event: FeedEvent) {
        self.cells
            .entry(event.cell.clone())
            .or_insert_with(|| CellBacklog::new(self.capacity))
            .push(event);
    }

    /// Merge the backlogs of the given cells, newest first, bounded by
    /// `limit`.
    pub fn fetch<'a>(
        &self,
        cells: impl IntoIterator<Item = &'a Cell>,
        limit: usize,
    ) -> BacklogPage {
        let mut merged: Vec<FeedEvent> = Vec::new();
        for cell in cells {
            if let Some(backlog) = self.cells.get(cell) {
                merged.extend(backlog.events.iter().cloned());
            }
        }

        // newest first: descending (created_at, event_id)
        merged.sort_by(|a, b| b.ordering_key().cmp(&a.ordering_key()));
        let has_more = merged.len() > limit;
        merged.truncate(limit);
        BacklogPage {
            events: merged,
            has_more,
        }
    }

    /// Number of cells holding at least one event.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EntityType, EventPayload, FeedEventType};
    use crate::ids::{EntityId, EventId};

    fn event(cell: &str, created_at: i64) -> FeedEvent {
        FeedEvent {
            event_id: EventId::new(),
            event_type: FeedEventType::NewListing,
            entity_type: EntityType::Listing,
            entity_id: EntityId::new(),
            cell: Cell::parse(cell).unwrap(),
            payload: EventPayload::new(),
            display_text: String::new(),
            created_at,
        }
    }

    #[test]
    fn test_fetch_is_newest_first() {
        let backlog = EventBacklog::new(10);
        backlog.push(event("drt2z0", 1));
        backlog.push(event("drt2z0", 3));
        backlog.push(event("drt2z0", 2));

        let page = backlog.fetch([&Cell::parse("drt2z0").unwrap()], 10);
        let stamps: Vec<i64> = page.events.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![3, 2, 1]);
        assert!(!page.has_more);
    }

    #[test]
    fn test_ring_evicts_oldest_at_capacity() {
        let backlog = EventBacklog::new(3);
        for i in 1..=5 {
            backlog.push(event("drt2z0", i));
        }
        let page = backlog.fetch([&Cell::parse("drt2z0").unwrap()], 10);
        let stamps: Vec<i64> = page.events.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![5, 4, 3]);
    }

    #[test]
    fn test_fetch_merges_across_cells() {
        let backlog = EventBacklog::new(10);
        backlog.push(event("drt2z0", 1));
        backlog.push(event("drt2z1", 4));
        backlog.push(event("drt2z0", 2));
        backlog.push(event("drt2z1", 3));

        let a = Cell::parse("drt2z0").unwrap();
        let b = Cell::parse("drt2z1").unwrap();
        let page = backlog.fetch([&a, &b], 10);
        let stamps: Vec<i64> = page.events.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_limit_sets_has_more() {
        let backlog = EventBacklog::new(10);
        for i in 1..=5 {
            backlog.push(event("drt2z0", i));
        }
        let page = backlog.fetch([&Cell::parse("drt2z0").unwrap()], 3);
        assert_eq!(page.events.len(), 3);
        assert!(page.has_more);
        assert_eq!(page.events[0].created_at, 5);
    }

    #[test]
    fn test_empty_cells_yield_empty_page() {
        let backlog = EventBacklog::new(10);
        let page = backlog.fetch([&Cell::parse("drt2z0").unwrap()], 10);
        assert!(page.events.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_timestamp_ties_break_on_event_id() {
        let backlog = EventBacklog::new(10);
        let e1 = event("drt2z0", 7);
        let e2 = event("drt2z0", 7);
        backlog.push(e1.clone());
        backlog.push(e2.clone());

        let page = backlog.fetch([&Cell::parse("drt2z0").unwrap()], 10);
        assert!(page.events[0].event_id > page.events[1].event_id);
    }
}
