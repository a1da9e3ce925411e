//! Observability for the signaling service.
//!
//! Metric labels are bounded:
//! - `type`: relay message types (~12 values)
//! - `outcome`: small fixed sets per metric
//! - `class`: rate-limit classes (4 values)
//! - `event`: cluster event kinds (5 values)
//!
//! Identities, room ids and connection ids never appear as labels.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sig_rooms_active` | Gauge | none |
//! | `sig_participants_active` | Gauge | none |
//! | `sig_connections_active` | Gauge | none |
//! | `sig_registry_mailbox_depth` | Gauge | none |
//! | `sig_relay_messages_total` | Counter | `type`, `outcome` |
//! | `sig_joins_total` | Counter | `outcome` |
//! | `sig_rooms_reaped_total` | Counter | none |
//! | `sig_outbox_dropped_total` | Counter | none |
//! | `sig_token_verifications_total` | Counter | `outcome` |
//! | `sig_rate_limit_decisions_total` | Counter | `class`, `outcome` |
//! | `sig_event_bus_events_total` | Counter | `event`, `direction` |
//! | `sig_store_latency_seconds` | Histogram | `operation` |
//! | `sig_http_request_duration_seconds` | Histogram | `method`, `status` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
