//! Test utilities for transport session testing.
//!
//! Provides a recording roster, a harness wiring every collaborator to
//! in-memory implementations, and presence builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use jid::{BareJid, Jid};
use tokio::sync::mpsc;
use waddle_transport::caps::{CachedDiscoInfo, Caps, CapsCache, Feature, Identity};
use waddle_transport::presence::NS_MUC;
use waddle_transport::storage::{MemoryStorageBackend, UserInfo, UserSettings};
use waddle_transport::{
    ChannelStanzaSink, OutboundStanza, RosterManager, SessionEvent, SessionReceivers,
    TransportConfig, TransportContext, UserSession,
};
use xmpp_parsers::minidom::Element;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

/// Gateway address used by every test.
pub const GATEWAY: &str = "transport.x";

/// Roster call observed by [`RecordingRoster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterCall {
    CurrentPresences(Jid),
    UnavailablePresences(Jid),
}

/// Roster manager that records every replay request.
#[derive(Debug, Default)]
pub struct RecordingRoster {
    calls: Mutex<Vec<RosterCall>>,
}

impl RecordingRoster {
    pub fn calls(&self) -> Vec<RosterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn current_presence_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RosterCall::CurrentPresences(_)))
            .count()
    }
}

impl RosterManager for RecordingRoster {
    fn send_current_presences(&self, to: &Jid) {
        self.calls
            .lock()
            .unwrap()
            .push(RosterCall::CurrentPresences(to.clone()));
    }

    fn send_unavailable_presences(&self, to: &Jid) {
        self.calls
            .lock()
            .unwrap()
            .push(RosterCall::UnavailablePresences(to.clone()));
    }
}

/// Every collaborator of a session, backed by in-memory fakes.
pub struct Harness {
    pub ctx: TransportContext,
    pub receivers: SessionReceivers,
    pub outbound: mpsc::UnboundedReceiver<OutboundStanza>,
    pub presences: Arc<waddle_transport::MemoryPresenceOracle>,
    pub caps: CapsCache,
    pub roster: Arc<RecordingRoster>,
    pub storage: Arc<MemoryStorageBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        let presences = Arc::new(waddle_transport::MemoryPresenceOracle::new());
        let caps = CapsCache::new();
        let roster = Arc::new(RecordingRoster::default());
        let (sink, outbound) = ChannelStanzaSink::new();
        let (ctx, receivers) = TransportContext::new(
            config,
            Arc::new(caps.clone()),
            presences.clone(),
            roster.clone(),
            Arc::new(sink),
        );

        Self {
            ctx,
            receivers,
            outbound,
            presences,
            caps,
            roster,
            storage: Arc::new(MemoryStorageBackend::new()),
        }
    }

    /// Create a session with default settings.
    pub fn session(&self, jid: &str) -> UserSession {
        self.session_with(jid, UserSettings::default())
    }

    pub fn session_with(&self, jid: &str, settings: UserSettings) -> UserSession {
        let bare: BareJid = jid.parse().unwrap();
        UserSession::new(
            bare,
            UserInfo::new(1, jid, "legacy"),
            settings,
            self.ctx.clone(),
        )
    }

    /// Record `presence` in the aggregator, as the front end does before dispatch.
    pub fn observe(&self, presence: &Presence) {
        self.presences.record(presence);
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receivers.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drain_outbound(&mut self) -> Vec<OutboundStanza> {
        let mut stanzas = Vec::new();
        while let Ok(stanza) = self.outbound.try_recv() {
            stanzas.push(stanza);
        }
        stanzas
    }
}

pub fn test_config() -> TransportConfig {
    TransportConfig {
        jid: GATEWAY.parse().unwrap(),
        ..TransportConfig::default()
    }
}

pub fn jid(s: &str) -> Jid {
    s.parse().unwrap()
}

/// Available presence from `from` to the gateway.
pub fn available(from: &str) -> Presence {
    let mut presence = Presence::new(PresenceType::None);
    presence.from = Some(jid(from));
    presence.to = Some(jid(GATEWAY));
    presence
}

/// Unavailable presence from `from` to the gateway.
pub fn unavailable(from: &str) -> Presence {
    let mut presence = Presence::new(PresenceType::Unavailable);
    presence.from = Some(jid(from));
    presence.to = Some(jid(GATEWAY));
    presence
}

/// Attach a capabilities element to a presence.
pub fn with_caps(mut presence: Presence, caps: &Caps) -> Presence {
    presence.payloads.push(caps.build_element());
    presence
}

/// MUC join presence from `from` to `room@transport.x/nick`.
pub fn room_join(from: &str, room: &str, nick: &str) -> Presence {
    let mut presence = Presence::new(PresenceType::None);
    presence.from = Some(jid(from));
    presence.to = Some(jid(&format!("{room}@{GATEWAY}/{nick}")));
    presence.payloads.push(Element::builder("x", NS_MUC).build());
    presence
}

/// MUC join presence carrying a room password.
pub fn room_join_with_password(from: &str, room: &str, nick: &str, password: &str) -> Presence {
    let mut presence = Presence::new(PresenceType::None);
    presence.from = Some(jid(from));
    presence.to = Some(jid(&format!("{room}@{GATEWAY}/{nick}")));
    presence.payloads.push(
        Element::builder("x", NS_MUC)
            .append(Element::builder("password", NS_MUC).append(password).build())
            .build(),
    );
    presence
}

/// Room leave presence from `from` to `room@transport.x/nick`.
pub fn room_leave(from: &str, room: &str, nick: &str) -> Presence {
    let mut presence = Presence::new(PresenceType::Unavailable);
    presence.from = Some(jid(from));
    presence.to = Some(jid(&format!("{room}@{GATEWAY}/{nick}")));
    presence
}

/// Disco#info for a desktop client advertising MUC.
pub fn muc_client_info() -> CachedDiscoInfo {
    CachedDiscoInfo::new(
        vec![Identity::new("client", "pc", Some("Test"))],
        vec![Feature::new(NS_MUC)],
    )
}
