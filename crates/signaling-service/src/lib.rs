//! Signaling Service Library
//!
//! WebRTC signaling relay: clients obtain a signed token, open a WebSocket,
//! join a room and exchange offer/answer/ICE messages with other members.
//! Media never passes through this service.
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs ----\
//!                                     +--> registry (actor) <-- tasks/reaper
//! relay/handler.rs -> connection ----/         |
//!                                              v change feed
//!                         cluster::sync -> EventBus -> other instances
//! ```
//!
//! # Modules
//!
//! - `auth` - Credential Service: token issue, verify, refresh
//! - `registry` - Room Registry actor
//! - `relay` - WebSocket relay connections and wire protocol
//! - `cluster` - session store, rate limiter, event bus, room replication
//! - `handlers`, `models`, `routes`, `middleware` - Control API
//! - `tasks` - reaper and session cleanup
//! - `config`, `errors`, `observability`

pub mod auth;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod tasks;
