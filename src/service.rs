//! Feed service composition
//!
//! Wires the ingest pipeline, heat engine, backlog and broadcaster into
//! one shared service. Event flow: validate → heat stats → backlog →
//! fan-out, in that order, so a client that just received an event can
//! immediately read heat data reflecting it.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::backlog::{BacklogPage, EventBacklog};
use crate::broadcast::FeedBroadcaster;
use crate::config::Config;
use crate::error::{GeoError, InvalidEvent};
use crate::events::FeedEvent;
use crate::geo::{cell_of, cells_within_radius};
use crate::heat::{HeatEngine, HeatIndex};
use crate::ingest::{EventIngester, IncomingEvent, IngestConfig};
use crate::session::SessionRegistry;

/// Health snapshot for the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub sessions: usize,
    pub subscribed_cells: usize,
    pub tracked_cells: usize,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub events_duplicated: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
}

/// The hyperlocal feed core: ingest, heat, backlog, sessions, fan-out.
pub struct FeedService {
    config: Config,
    ingester: EventIngester,
    heat: HeatEngine,
    backlog: EventBacklog,
    registry: Arc<SessionRegistry>,
    broadcaster: FeedBroadcaster,
}

impl FeedService {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.clone()));
        let broadcaster = FeedBroadcaster::new(Arc::clone(&registry));
        Self {
            ingester: EventIngester::new(IngestConfig {
                dedup_window: config.dedup_window,
                cell_precision: config.cell_precision,
            }),
            heat: HeatEngine::new(config.heat.clone()),
            backlog: EventBacklog::new(config.backlog_capacity),
            registry,
            broadcaster,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Validate and process one raw event submission.
    ///
    /// Returns the accepted event, or `None` for a duplicate. Stats are
    /// updated before fan-out begins.
    pub fn ingest(&self, raw: IncomingEvent) -> Result<Option<FeedEvent>, InvalidEvent> {
        let Some(event) = self.ingester.ingest(raw)? else {
            return Ok(None);
        };

        self.heat.record_event(&event);
        self.backlog.push(event.clone());
        let delivered = self.broadcaster.broadcast(&event);
        info!(
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            cell = %event.cell,
            delivered,
            "event processed"
        );
        Ok(Some(event))
    }

    /// Record a save engagement at a coordinate.
    pub fn record_save(&self, lat: f64, lng: f64) -> Result<(), GeoError> {
        let cell = cell_of(lat, lng, self.config.cell_precision)?;
        self.heat.record_save(&cell, FeedEvent::now_millis());
        Ok(())
    }

    /// Heat snapshot for the cell containing a coordinate.
    pub fn heat_index_at(&self, lat: f64, lng: f64) -> Result<HeatIndex, GeoError> {
        let cell = cell_of(lat, lng, self.config.cell_precision)?;
        Ok(self.heat.heat_index(&cell))
    }

    /// Recent events around a coordinate, newest first.
    pub fn activity_ribbon(
        &self,
        lat: f64,
        lng: f64,
        radius: Option<f64>,
        limit: usize,
    ) -> Result<BacklogPage, GeoError> {
        let radius_miles = self.registry.clamp_radius(radius);
        let cells =
            cells_within_radius(lat, lng, radius_miles, self.config.cell_precision)?;
        Ok(self.backlog.fetch(cells.iter(), limit))
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            sessions: self.registry.session_count(),
            subscribed_cells: self.registry.subscribed_cell_count(),
            tracked_cells: self.heat.cell_count(),
            events_accepted: self.ingester.accepted(),
            events_rejected: self.ingester.rejected(),
            events_duplicated: self.ingester.duplicates(),
            events_delivered: self.broadcaster.total_delivered(),
            events_dropped: self.broadcaster.total_dropped(),
        }
    }
}
