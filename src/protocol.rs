//! WebSocket wire protocol
//!
//! Tagged JSON messages in both directions. Server frames wrap their
//! body in a `data` field; client frames are flat.

use serde::{Deserialize, Serialize};

use crate::events::FeedEvent;
use crate::ids::SessionId;

/// A lat/lng pair as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Center {
    pub lat: f64,
    pub lng: f64,
}

/// Reconnection guidance advertised in the handshake. Clients back off
/// exponentially and replay the activity ribbon after reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedData {
    pub session_id: SessionId,
    pub center: Center,
    pub radius_miles: f64,
    /// Number of cells the subscription covers.
    pub channels_count: usize,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdatedData {
    pub center: Center,
    pub channels_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { data: ConnectedData },
    FeedEvent { data: FeedEvent },
    LocationUpdated { data: LocationUpdatedData },
    Pong,
    Error { data: ErrorData },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            data: ErrorData {
                message: message.into(),
            },
        }
    }
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UpdateLocation {
        lat: f64,
        lng: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        radius: Option<f64>,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_wire_shape() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_error_wire_shape() {
        let json = serde_json::to_string(&ServerMessage::error("bad frame")).unwrap();
        assert_eq!(json, r#"{"type":"error","data":{"message":"bad frame"}}"#);
    }

    #[test]
    fn test_client_update_location_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"update_location","lat":42.36,"lng":-71.06}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::UpdateLocation {
                lat: 42.36,
                lng: -71.06,
                radius: None,
            }
        );
    }

    #[test]
    fn test_client_ping_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_unknown_client_frame_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_connected_frame_carries_reconnect_policy() {
        let msg = ServerMessage::Connected {
            data: ConnectedData {
                session_id: SessionId::new(),
                center: Center {
                    lat: 42.36,
                    lng: -71.06,
                },
                radius_miles: 3.0,
                channels_count: 12,
                reconnect: ReconnectPolicy::default(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"connected""#));
        assert!(json.contains(r#""initial_delay_ms":1000"#));
    }
}
