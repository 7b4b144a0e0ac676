//! Subscription session management
//!
//! A session is one WebSocket subscriber with a geographic coverage:
//! center, radius and the set of cells within it. The registry holds
//! every live session plus a reverse index cell → session ids used by
//! the broadcaster for fan-out.
//!
//! Lifecycle: `Connecting → Active → (Updating ⇄ Active) → Closed`.
//! Closing removes the session from every covered cell's subscriber set
//! before the delivery loop winds down, so no partial unregistration is
//! observable. Reconnection is always a brand-new session.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::geo::{cells_within_radius, Cell};
use crate::ids::{EventId, SessionId};
use crate::protocol::ServerMessage;

/// Session manager tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cadence of the stale-session sweep, seconds.
    pub sweep_interval_secs: u64,
    /// Idle time after which a session is closed, seconds.
    pub stale_timeout_secs: i64,
    /// Outbound queue depth per session.
    pub queue_capacity: usize,
    /// Malformed control messages tolerated before the session is closed.
    pub strike_limit: u32,
    pub default_radius_miles: f64,
    pub min_radius_miles: f64,
    pub max_radius_miles: f64,
    /// Geohash precision for coverage cells.
    pub cell_precision: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            stale_timeout_secs: 90,
            queue_capacity: 256,
            strike_limit: 5,
            default_radius_miles: 3.0,
            min_radius_miles: 1.0,
            max_radius_miles: 10.0,
            cell_precision: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Active,
    Updating,
    Closed,
}

/// Geographic coverage of a session.
#[derive(Debug, Clone)]
pub struct Coverage {
    pub lat: f64,
    pub lng: f64,
    pub radius_miles: f64,
    pub cells: BTreeSet<Cell>,
}

/// Outcome of offering one event to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// At or before the session's delivered-event cursor.
    Duplicate,
    /// Outbound queue full; the event is dropped for this session.
    QueueFull,
    Closed,
}

/// Shared state of one live session.
pub struct SessionState {
    pub session_id: SessionId,
    phase: Mutex<SessionPhase>,
    coverage: Mutex<Coverage>,
    sender: mpsc::Sender<Message>,
    /// Last liveness signal, Unix milliseconds.
    last_seen: AtomicI64,
    /// Cursor of the last enqueued event, for duplicate suppression.
    cursor: Mutex<Option<(i64, EventId)>>,
    strikes: AtomicU32,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        *lock_unpoisoned(&self.phase)
    }

    pub fn coverage(&self) -> Coverage {
        lock_unpoisoned(&self.coverage).clone()
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Serialize and enqueue a control frame.
    pub fn send(&self, msg: &ServerMessage) -> Result<(), SessionError> {
        if self.phase() == SessionPhase::Closed {
            return Err(SessionError::Closed);
        }
        let text = serde_json::to_string(msg)
            .map_err(|e| SessionError::MalformedControlMessage(e.to_string()))?;
        self.sender
            .try_send(Message::Text(text))
            .map_err(|_| SessionError::Closed)
    }

    /// Offer a pre-serialized event frame to this session's queue.
    ///
    /// The cursor makes delivery per session non-decreasing in the event
    /// ordering key, so relocation overlap cannot re-deliver an event.
    pub fn offer_event(&self, key: (i64, EventId), frame: &str) -> DeliveryOutcome {
        if self.phase() == SessionPhase::Closed {
            return DeliveryOutcome::Closed;
        }

        let mut cursor = lock_unpoisoned(&self.cursor);
        if cursor.is_some_and(|seen| key <= seen) {
            return DeliveryOutcome::Duplicate;
        }

        match self.sender.try_send(Message::Text(frame.to_string())) {
            Ok(()) => {
                *cursor = Some(key);
                self.delivered.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Delivered
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }
}

/// All live sessions plus the cell → sessions reverse index.
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: DashMap<SessionId, Arc<SessionState>>,
    by_cell: DashMap<Cell, DashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            by_cell: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Clamp a requested radius into the configured bounds.
    pub fn clamp_radius(&self, radius: Option<f64>) -> f64 {
        radius
            .unwrap_or(self.config.default_radius_miles)
            .clamp(self.config.min_radius_miles, self.config.max_radius_miles)
    }

    /// Open a new session in the `Connecting` phase.
    ///
    /// Returns the shared state and the receiving end of the outbound
    /// queue for the connection's delivery loop.
    pub fn open(
        &self,
        lat: f64,
        lng: f64,
        radius: Option<f64>,
    ) -> Result<(Arc<SessionState>, mpsc::Receiver<Message>), SessionError> {
        let radius_miles = self.clamp_radius(radius);
        let cells = cells_within_radius(lat, lng, radius_miles, self.config.cell_precision)?;

        let (sender, receiver) = mpsc::channel(self.config.queue_capacity);
        let session_id = SessionId::new();
        let state = Arc::new(SessionState {
            session_id,
            phase: Mutex::new(SessionPhase::Connecting),
            coverage: Mutex::new(Coverage {
                lat,
                lng,
                radius_miles,
                cells: cells.clone(),
            }),
            sender,
            last_seen: AtomicI64::new(Utc::now().timestamp_millis()),
            cursor: Mutex::new(None),
            strikes: AtomicU32::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        self.sessions.insert(session_id, Arc::clone(&state));
        for cell in &cells {
            self.by_cell
                .entry(cell.clone())
                .or_default()
                .insert(session_id);
        }

        info!(
            session_id = %session_id,
            cells = cells.len(),
            radius_miles,
            "session opened"
        );
        Ok((state, receiver))
    }

    /// Mark a session active once the handshake frame has been sent.
    pub fn activate(&self, state: &SessionState) {
        *lock_unpoisoned(&state.phase) = SessionPhase::Active;
        state.touch();
    }

    /// Recompute a session's coverage for a new center without dropping
    /// the connection.
    pub fn update_location(
        &self,
        state: &SessionState,
        lat: f64,
        lng: f64,
        radius: Option<f64>,
    ) -> Result<Coverage, SessionError> {
        {
            let mut phase = lock_unpoisoned(&state.phase);
            if *phase == SessionPhase::Closed {
                return Err(SessionError::Closed);
            }
            *phase = SessionPhase::Updating;
        }

        let radius_miles = match radius {
            Some(_) => self.clamp_radius(radius),
            None => state.coverage().radius_miles,
        };
        let new_cells = match cells_within_radius(lat, lng, radius_miles, self.config.cell_precision)
        {
            Ok(cells) => cells,
            Err(err) => {
                // coverage unchanged; session stays usable
                *lock_unpoisoned(&state.phase) = SessionPhase::Active;
                return Err(err.into());
            }
        };

        let old_cells = {
            let mut coverage = lock_unpoisoned(&state.coverage);
            let old = std::mem::replace(
                &mut *coverage,
                Coverage {
                    lat,
                    lng,
                    radius_miles,
                    cells: new_cells.clone(),
                },
            );
            old.cells
        };

        for cell in old_cells.difference(&new_cells) {
            self.unsubscribe_cell(cell, state.session_id);
        }
        for cell in new_cells.difference(&old_cells) {
            self.by_cell
                .entry(cell.clone())
                .or_default()
                .insert(state.session_id);
        }

        *lock_unpoisoned(&state.phase) = SessionPhase::Active;
        state.touch();
        debug!(
            session_id = %state.session_id,
            cells = new_cells.len(),
            "session relocated"
        );
        Ok(state.coverage())
    }

    /// Count a malformed control message. Returns true when the strike
    /// limit is reached and the session has been closed.
    pub fn record_malformed(&self, state: &SessionState) -> bool {
        let strikes = state.strikes.fetch_add(1, Ordering::Relaxed) + 1;
        if strikes >= self.config.strike_limit {
            warn!(
                session_id = %state.session_id,
                strikes,
                "strike limit reached, closing session"
            );
            self.close(state.session_id);
            true
        } else {
            false
        }
    }

    /// Close a session and release all its cell subscriptions.
    pub fn close(&self, session_id: SessionId) {
        let Some((_, state)) = self.sessions.remove(&session_id) else {
            return;
        };
        *lock_unpoisoned(&state.phase) = SessionPhase::Closed;
        let coverage = state.coverage();
        for cell in &coverage.cells {
            self.unsubscribe_cell(cell, session_id);
        }
        info!(
            session_id = %session_id,
            delivered = state.delivered(),
            dropped = state.dropped(),
            "session closed"
        );
    }

    fn unsubscribe_cell(&self, cell: &Cell, session_id: SessionId) {
        if let Some(subscribers) = self.by_cell.get(cell) {
            subscribers.remove(&session_id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.by_cell
                    .remove_if(cell, |_, subscribers| subscribers.is_empty());
            }
        }
    }

    /// Close every session idle beyond the stale timeout. Returns the
    /// ids that were closed.
    pub fn sweep_stale(&self) -> Vec<SessionId> {
        let cutoff =
            Utc::now().timestamp_millis() - self.config.stale_timeout_secs * 1_000;
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().last_seen() < cutoff)
            .map(|entry| *entry.key())
            .collect();

        for session_id in &stale {
            debug!(session_id = %session_id, "session timed out");
            self.close(*session_id);
        }
        stale
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<SessionState>> {
        self.sessions.get(&session_id).map(|s| Arc::clone(&s))
    }

    /// Sessions whose coverage includes the given cell.
    pub fn sessions_for_cell(&self, cell: &Cell) -> Vec<Arc<SessionState>> {
        let Some(subscribers) = self.by_cell.get(cell) else {
            return Vec::new();
        };
        subscribers
            .iter()
            .filter_map(|id| self.get(*id))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cells with at least one subscriber.
    pub fn subscribed_cell_count(&self) -> usize {
        self.by_cell.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOSTON: (f64, f64) = (42.3601, -71.0589);

    fn registry() -> SessionRegistry {
        SessionRegistry::new(SessionConfig::default())
    }

    #[tokio::test]
    async fn test_open_covers_cells_and_registers() {
        let registry = registry();
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, Some(3.0)).unwrap();

        assert_eq!(state.phase(), SessionPhase::Connecting);
        let coverage = state.coverage();
        assert!(!coverage.cells.is_empty());
        assert_eq!(registry.session_count(), 1);

        for cell in &coverage.cells {
            assert!(registry
                .sessions_for_cell(cell)
                .iter()
                .any(|s| s.session_id == state.session_id));
        }
    }

    #[tokio::test]
    async fn test_radius_is_clamped() {
        let registry = registry();
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, Some(50.0)).unwrap();
        assert_eq!(state.coverage().radius_miles, 10.0);

        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, Some(0.1)).unwrap();
        assert_eq!(state.coverage().radius_miles, 1.0);

        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        assert_eq!(state.coverage().radius_miles, 3.0);
    }

    #[tokio::test]
    async fn test_open_rejects_bad_coordinates() {
        let registry = registry();
        assert!(registry.open(95.0, 0.0, None).is_err());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_update_location_swaps_coverage() {
        let registry = registry();
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, Some(2.0)).unwrap();
        registry.activate(&state);
        let old_cells = state.coverage().cells;

        // Manhattan, far enough that coverage is disjoint
        let coverage = registry
            .update_location(&state, 40.7128, -74.0060, None)
            .unwrap();
        assert_eq!(state.phase(), SessionPhase::Active);
        assert!(old_cells.is_disjoint(&coverage.cells));

        for cell in &old_cells {
            assert!(registry.sessions_for_cell(cell).is_empty());
        }
        for cell in &coverage.cells {
            assert_eq!(registry.sessions_for_cell(cell).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_update_location_with_bad_input_keeps_session() {
        let registry = registry();
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        registry.activate(&state);
        let before = state.coverage();

        assert!(registry.update_location(&state, 200.0, 0.0, None).is_err());
        assert_eq!(state.phase(), SessionPhase::Active);
        assert_eq!(state.coverage().cells, before.cells);
    }

    #[tokio::test]
    async fn test_close_releases_all_subscriptions() {
        let registry = registry();
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        let cells = state.coverage().cells;

        registry.close(state.session_id);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(state.phase(), SessionPhase::Closed);
        for cell in &cells {
            assert!(registry.sessions_for_cell(cell).is_empty());
        }
    }

    #[tokio::test]
    async fn test_offer_event_dedupes_on_cursor() {
        let registry = registry();
        let (state, mut rx) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        registry.activate(&state);

        let key = (100, EventId::new());
        assert_eq!(state.offer_event(key, "{}"), DeliveryOutcome::Delivered);
        assert_eq!(state.offer_event(key, "{}"), DeliveryOutcome::Duplicate);

        // strictly older key is also suppressed
        let older = (99, EventId::new());
        assert_eq!(state.offer_event(older, "{}"), DeliveryOutcome::Duplicate);

        assert!(rx.recv().await.is_some());
        assert_eq!(state.delivered(), 1);
    }

    #[tokio::test]
    async fn test_offer_event_drops_newest_when_full() {
        let registry = SessionRegistry::new(SessionConfig {
            queue_capacity: 2,
            ..SessionConfig::default()
        });
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        registry.activate(&state);

        assert_eq!(
            state.offer_event((1, EventId::new()), "{}"),
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            state.offer_event((2, EventId::new()), "{}"),
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            state.offer_event((3, EventId::new()), "{}"),
            DeliveryOutcome::QueueFull
        );
        assert_eq!(state.dropped(), 1);
    }

    #[tokio::test]
    async fn test_strike_limit_closes_session() {
        let registry = SessionRegistry::new(SessionConfig {
            strike_limit: 3,
            ..SessionConfig::default()
        });
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        registry.activate(&state);

        assert!(!registry.record_malformed(&state));
        assert!(!registry.record_malformed(&state));
        assert!(registry.record_malformed(&state));
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_closes_only_stale_sessions() {
        let registry = SessionRegistry::new(SessionConfig {
            stale_timeout_secs: 90,
            ..SessionConfig::default()
        });
        let (stale, _rx1) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        let (fresh, _rx2) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        registry.activate(&stale);
        registry.activate(&fresh);

        stale
            .last_seen
            .store(Utc::now().timestamp_millis() - 120_000, Ordering::Relaxed);

        let closed = registry.sweep_stale();
        assert_eq!(closed, vec![stale.session_id]);
        assert_eq!(registry.session_count(), 1);
        assert!(registry.get(fresh.session_id).is_some());
    }

    #[tokio::test]
    async fn test_send_after_close_is_an_error() {
        let registry = registry();
        let (state, _rx) = registry.open(BOSTON.0, BOSTON.1, None).unwrap();
        registry.close(state.session_id);
        assert!(matches!(
            state.send(&ServerMessage::Pong),
            Err(SessionError::Closed)
        ));
    }
}
