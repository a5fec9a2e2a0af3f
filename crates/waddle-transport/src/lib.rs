//! # waddle-transport
//!
//! Session-bridging core of an XMPP transport to a legacy network.
//!
//! One logical user may be connected from many XMPP resources at once, while
//! the legacy network gets a single connection per user. This crate keeps the
//! two sides consistent as resources come and go, join and leave rooms, and
//! as the backend connection fails and is retried.
//!
//! ## Architecture
//!
//! - **UserSession**: Per-user state machine (readiness, presence mirroring,
//!   room membership, bounded silent reconnects)
//! - **ConversationManager**: The rooms and one-to-one exchanges of a user
//! - **UserManager**: Registry of sessions and the front-end event loop
//! - **ReconnectScheduler**: Paced reconnection of users on gateway link-up
//!
//! Capability discovery, presence aggregation, roster synchronisation,
//! storage and stanza I/O are collaborators reached through traits.
//!
//! ## XEP Support
//!
//! - XEP-0045 (Multi-User Chat) join/leave presence
//! - XEP-0106 (JID Escaping) for legacy names
//! - XEP-0115 (Entity Capabilities)

pub mod caps;
pub mod channel;
pub mod config;
pub mod conversation;
pub mod manager;
pub mod presence;
pub mod reconnecter;
pub mod session;
pub mod storage;
pub mod telemetry;

mod error;

pub use caps::{CachedDiscoInfo, CapabilityCache, Caps, CapsCache, Feature, Identity};
pub use channel::{ChannelStanzaSink, OutboundStanza, RosterManager, StanzaChannel};
pub use config::{GatewayMode, TransportConfig};
pub use conversation::{Conversation, ConversationManager, Occupant};
pub use error::{BackendErrorKind, TransportError, NS_TRANSPORT_ERROR};
pub use manager::{FrontendEvent, UserManager, UserManagerEvent};
pub use presence::{MemoryPresenceOracle, PresenceOracle};
pub use reconnecter::{ReconnectScheduler, TickOutcome};
pub use session::{
    DisconnectOutcome, SessionEvent, SessionReceivers, TimerEvent, TransportContext, UserSession,
};
pub use storage::{MemoryStorageBackend, StorageBackend, UserInfo, UserSettings};
