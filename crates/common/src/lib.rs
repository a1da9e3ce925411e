//! Common utilities and types shared across the signaling relay crates.

#![warn(clippy::pedantic)]

/// Typed identifiers (rooms, participants, connections, sessions)
pub mod types;

/// Secret types that prevent accidental logging
pub mod secret;

/// Token claim types and pre-parse validation
pub mod jwt;
