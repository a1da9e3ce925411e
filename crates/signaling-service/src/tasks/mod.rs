//! Periodic background tasks.
//!
//! Each task ticks on a `tokio::time::interval` with
//! `MissedTickBehavior::Skip`, logs failures and retries on the next tick,
//! and exits when its cancellation token fires.

pub mod reaper;
pub mod session_cleanup;

pub use reaper::start_room_reaper;
pub use session_cleanup::start_session_cleanup;
