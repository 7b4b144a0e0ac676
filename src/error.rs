//! Error types for the feed service
//!
//! Each failure domain gets its own enum; nothing here is fatal to the
//! process. Every error is scoped to a single event, session, or request.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ids::SessionId;

/// Geospatial input errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeoError {
    #[error("Invalid latitude: {0} (must be within [-90, 90])")]
    InvalidLatitude(f64),

    #[error("Invalid longitude: {0} (must be within [-180, 180])")]
    InvalidLongitude(f64),

    #[error("Invalid radius: {0} (must be positive)")]
    InvalidRadius(f64),

    #[error("Invalid cell precision: {0} (must be within [1, 12])")]
    InvalidPrecision(u8),

    #[error("Invalid cell id: {0}")]
    InvalidCell(String),
}

/// Event ingest validation errors
///
/// Malformed input is rejected and logged, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidEvent {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Missing payload key {key} for event type {event_type}")]
    MissingPayloadKey {
        event_type: &'static str,
        key: &'static str,
    },

    #[error("Invalid payload value for {key}: {reason}")]
    InvalidPayloadValue { key: &'static str, reason: String },

    #[error("Event carries neither coordinates nor a cell id")]
    MissingLocation,

    #[error(transparent)]
    Geo(#[from] GeoError),
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session is closed")]
    Closed,

    #[error("Malformed control message: {0}")]
    MalformedControlMessage(String),

    #[error(transparent)]
    Geo(#[from] GeoError),
}

/// Central error type for the HTTP surface
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<GeoError> for AppError {
    fn from(err: GeoError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<InvalidEvent> for AppError {
    fn from(err: InvalidEvent) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "INTERNAL_ERROR",
            ),
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
