//! HTTP and WebSocket surface
//!
//! One axum router: the `/ws/activity` subscription endpoint, the v2
//! feed query API, the internal ingest entry points, and `/health`.
//! Each WebSocket connection runs a single delivery loop multiplexing
//! the session's outbound queue, inbound control frames and a keepalive
//! ping interval.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::geo::validate_coordinates;
use crate::ingest::IncomingEvent;
use crate::protocol::{Center, ClientMessage, ConnectedData, LocationUpdatedData, ServerMessage};
use crate::service::FeedService;
use crate::session::{SessionPhase, SessionState};

/// Hard cap on ribbon page size.
const MAX_RIBBON_LIMIT: usize = 50;
const DEFAULT_RIBBON_LIMIT: usize = 20;

/// Keepalive ping cadence on the socket, independent of the session
/// liveness sweep.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub fn router(service: Arc<FeedService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/activity", get(ws_activity))
        .route("/v2/feed/heat-index", get(heat_index))
        .route("/v2/feed/activity-ribbon", get(activity_ribbon))
        .route("/internal/events", post(ingest_event))
        .route("/internal/saves", post(record_save))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Periodic stale-session sweep, independent of the event path.
pub fn spawn_sweeper(service: Arc<FeedService>) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(service.config().session.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let closed = service.registry().sweep_stale();
            if !closed.is_empty() {
                info!(closed = closed.len(), "stale sessions swept");
            }
        }
    })
}

async fn health(State(service): State<Arc<FeedService>>) -> impl IntoResponse {
    Json(service.health())
}

#[derive(Debug, Deserialize)]
struct PointQuery {
    lat: f64,
    lng: f64,
}

async fn heat_index(
    State(service): State<Arc<FeedService>>,
    Query(query): Query<PointQuery>,
) -> Result<Response, AppError> {
    let index = service.heat_index_at(query.lat, query.lng)?;
    Ok(Json(index).into_response())
}

#[derive(Debug, Deserialize)]
struct RibbonQuery {
    lat: f64,
    lng: f64,
    radius: Option<f64>,
    limit: Option<usize>,
}

async fn activity_ribbon(
    State(service): State<Arc<FeedService>>,
    Query(query): Query<RibbonQuery>,
) -> Result<Response, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RIBBON_LIMIT)
        .min(MAX_RIBBON_LIMIT);
    let page = service.activity_ribbon(query.lat, query.lng, query.radius, limit)?;
    Ok(Json(page).into_response())
}

async fn ingest_event(
    State(service): State<Arc<FeedService>>,
    Json(raw): Json<IncomingEvent>,
) -> Result<Response, AppError> {
    match service.ingest(raw)? {
        Some(event) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "event_id": event.event_id })),
        )
            .into_response()),
        None => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": false, "duplicate": true })),
        )
            .into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    lat: f64,
    lng: f64,
}

async fn record_save(
    State(service): State<Arc<FeedService>>,
    Json(body): Json<SaveRequest>,
) -> Result<Response, AppError> {
    service.record_save(body.lat, body.lng)?;
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Debug, Deserialize)]
struct ActivityParams {
    lat: f64,
    lng: f64,
    radius: Option<f64>,
}

async fn ws_activity(
    ws: WebSocketUpgrade,
    State(service): State<Arc<FeedService>>,
    Query(params): Query<ActivityParams>,
) -> Result<Response, AppError> {
    // reject bad coordinates before the upgrade
    validate_coordinates(params.lat, params.lng)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, service, params)))
}

async fn handle_socket(socket: WebSocket, service: Arc<FeedService>, params: ActivityParams) {
    let registry = service.registry();
    let (session, outbound) = match registry.open(params.lat, params.lng, params.radius) {
        Ok(pair) => pair,
        Err(err) => {
            warn!(error = %err, "subscription rejected");
            let mut socket = socket;
            if let Ok(frame) = serde_json::to_string(&ServerMessage::error(err.to_string())) {
                let _ = socket.send(Message::Text(frame)).await;
            }
            let _ = socket.close().await;
            return;
        }
    };

    let coverage = session.coverage();
    let connected = ServerMessage::Connected {
        data: ConnectedData {
            session_id: session.session_id,
            center: Center {
                lat: coverage.lat,
                lng: coverage.lng,
            },
            radius_miles: coverage.radius_miles,
            channels_count: coverage.cells.len(),
            reconnect: service.config().reconnect,
        },
    };
    if session.send(&connected).is_err() {
        registry.close(session.session_id);
        return;
    }
    registry.activate(&session);

    run_session_loop(socket, &service, &session, outbound).await;
    service.registry().close(session.session_id);
    debug!(session_id = %session.session_id, "connection closed");
}

async fn run_session_loop(
    socket: WebSocket,
    service: &Arc<FeedService>,
    session: &Arc<SessionState>,
    mut outbound: mpsc::Receiver<Message>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                match queued {
                    Some(msg) => {
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // session was closed elsewhere (sweep, strikes)
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_frame(service, session, &text) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        session.touch();
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // binary frames are not part of the protocol
                        if service.registry().record_malformed(session) {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(session_id = %session.session_id, error = %err, "socket error");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                // the sweep closes sessions out-of-band; the connection
                // follows on the next tick
                if session.phase() == SessionPhase::Closed {
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Handle one inbound text frame. Returns false when the session should
/// wind down.
fn handle_client_frame(
    service: &Arc<FeedService>,
    session: &Arc<SessionState>,
    text: &str,
) -> bool {
    let registry = service.registry();
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(session_id = %session.session_id, error = %err, "malformed frame");
            let _ = session.send(&ServerMessage::error("malformed message"));
            return !registry.record_malformed(session);
        }
    };

    session.touch();
    match msg {
        ClientMessage::Ping => {
            let _ = session.send(&ServerMessage::Pong);
            true
        }
        ClientMessage::UpdateLocation { lat, lng, radius } => {
            match registry.update_location(session, lat, lng, radius) {
                Ok(coverage) => {
                    let _ = session.send(&ServerMessage::LocationUpdated {
                        data: LocationUpdatedData {
                            center: Center {
                                lat: coverage.lat,
                                lng: coverage.lng,
                            },
                            channels_count: coverage.cells.len(),
                        },
                    });
                    true
                }
                Err(err) => {
                    let _ = session.send(&ServerMessage::error(err.to_string()));
                    true
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_router_builds() {
        let service = Arc::new(FeedService::new(Config::default()));
        let _router = router(service);
    }
}
