//! # Signaling Test Utilities
//!
//! Shared test utilities for the signaling service.
//!
//! This crate provides:
//! - Server test harness (`TestSignalingServer`, in-process on `127.0.0.1:0`)
//! - Token fixtures (`TEST_JWT_SECRET`, `test_config`)
//! - A JSON WebSocket client for the relay protocol (`WsClient`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestSignalingServer::spawn().await?;
//!     let token = server.access_token("agent-1")?;
//!     let mut ws = WsClient::connect(&server.ws_url(&token)).await?;
//!     ws.send_json(&serde_json::json!({"type": "ping"})).await?;
//!     assert_eq!(ws.recv_json().await?["type"], "pong");
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::*;
pub use ws_client::*;
