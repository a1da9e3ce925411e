//! Room registry: the authoritative record of rooms hosted on this instance
//! and who is in them.
//!
//! ```text
//! relay connections ──┐
//! control API ────────┼──► RegistryHandle ──► RegistryActor (rooms, members)
//! reaper task ────────┘                           │
//!                                                  ├──► connection outboxes
//!                                                  └──► RoomChange feed ──► cluster publisher
//! ```

pub mod actor;
pub mod mailbox;
pub mod messages;
pub mod model;

pub use actor::{RegistryActor, RegistryConfig, RegistryHandle};
pub use mailbox::{MailboxLevel, MailboxMonitor};
pub use model::{
    CloseReason, ConnectionOutbox, ConnectionRoomInfo, JoinOutcome, JoinRejection, JoinRequest,
    LeaveReason, NewRoom, Participant, ParticipantPatch, RegistryStats, RelayRejection, Role, Room,
    RoomChange, RoomEvent, RoomKind, RoomSettings, RoomSnapshot, RoomSummary, SettingsPatch,
    Signal, SignalKind, VoiceSettings,
};
