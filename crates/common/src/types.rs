//! Typed identifiers used across the signaling relay.
//!
//! Every identifier is a random v4 UUID wrapped in a newtype so a room id can
//! never be passed where a connection id is expected. Identifiers serialize
//! as their plain hyphenated string form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a room
    RoomId
);

uuid_id!(
    /// Unique identifier for a participant (one membership of one connection)
    ParticipantId
);

uuid_id!(
    /// Unique identifier for a live relay connection
    ConnectionId
);

uuid_id!(
    /// Unique identifier for a session record in the shared store
    SessionId
);
