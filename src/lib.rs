//! Hyperlocal feed and heat-ranking engine
//!
//! Real-time core of a sneaker-marketplace platform: marketplace events
//! are ingested, folded into per-cell rolling heat statistics, retained
//! in a bounded backlog, and fanned out live to geographically
//! subscribed WebSocket clients.
//!
//! Pipeline: ingest validates and stamps the event and resolves its
//! geohash cell; the heat engine updates that cell's stats; the backlog
//! keeps it for ribbon reads; the broadcaster pushes it to every session
//! whose coverage includes the cell.

pub mod backlog;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod geo;
pub mod heat;
pub mod ids;
pub mod ingest;
pub mod protocol;
pub mod server;
pub mod service;
pub mod session;

pub use config::Config;
pub use events::{FeedEvent, FeedEventType};
pub use heat::{HeatIndex, HeatLevel};
pub use ingest::IncomingEvent;
pub use service::FeedService;
