//! Per-user session state machine.
//!
//! A [`UserSession`] bridges one bare identity (with any number of connected
//! resources) onto a single backend connection. It decides when the backend
//! connection may be opened, mirrors aggregated presence toward the backend,
//! tracks room membership and handles backend disconnects with bounded
//! silent retries.
//!
//! Handlers run to completion on the owning event loop and never return
//! errors; what they want the outside world to do is published as
//! [`SessionEvent`]s and outbound stanzas.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xmpp_parsers::message::{Body, Message, MessageType};
use xmpp_parsers::presence::{Presence, Show, Type as PresenceType};

use crate::caps::{extract_caps, CachedDiscoInfo, CapabilityCache};
use crate::channel::{RosterManager, StanzaChannel};
use crate::config::TransportConfig;
use crate::conversation::{Conversation, ConversationManager, Occupant};
use crate::presence::{
    build_unavailable, gateway_address, is_room_presence, is_unavailable, legacy_name,
    muc_password, resource_of, PresenceOracle, CONNECTING_STATUS,
};
use crate::storage::{UserInfo, UserSettings};
use crate::BackendErrorKind;

/// Notifications a session publishes for the backend and the registry.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Enough is known about the user to open the backend connection
    ReadyToConnect { jid: BareJid },
    /// Aggregated presence to mirror on the backend
    PresenceChanged { jid: BareJid, presence: Box<Presence> },
    /// Presence the backend should see verbatim (rooms, peers, sticky xa)
    RawPresence { jid: BareJid, presence: Box<Presence> },
    /// A resource joined a room
    RoomJoined {
        jid: BareJid,
        /// Joining resource
        from: Jid,
        room: String,
        nickname: String,
        password: Option<String>,
    },
    /// The last resource left a room
    RoomLeft { jid: BareJid, room: String },
    /// The backend connection ended for good
    Disconnected {
        jid: BareJid,
        reason: String,
        kind: BackendErrorKind,
    },
    /// Every resource of the user went unavailable
    LastResourceGone { jid: BareJid },
}

impl SessionEvent {
    /// Bare identity of the session that published the event.
    pub fn jid(&self) -> &BareJid {
        match self {
            Self::ReadyToConnect { jid }
            | Self::PresenceChanged { jid, .. }
            | Self::RawPresence { jid, .. }
            | Self::RoomJoined { jid, .. }
            | Self::RoomLeft { jid, .. }
            | Self::Disconnected { jid, .. }
            | Self::LastResourceGone { jid } => jid,
        }
    }
}

/// Timer expirations delivered back to the owning event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The capability wait of `jid` ran out
    CapsWaitElapsed { jid: BareJid, generation: u64 },
}

/// What a backend disconnect resulted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Swallowed during a backend hand-off
    Ignored,
    /// Transient error; the session was reset and asked to reconnect
    Retrying { attempt: u32 },
    /// The session must be removed from its registry
    Terminated,
}

/// Shared collaborators every session talks to.
#[derive(Clone)]
pub struct TransportContext {
    pub config: Arc<TransportConfig>,
    pub caps: Arc<dyn CapabilityCache>,
    pub presences: Arc<dyn PresenceOracle>,
    pub roster: Arc<dyn RosterManager>,
    pub channel: Arc<dyn StanzaChannel>,
    events: mpsc::UnboundedSender<SessionEvent>,
    timers: mpsc::UnboundedSender<TimerEvent>,
}

/// Receiving ends of the channels sessions publish on.
#[derive(Debug)]
pub struct SessionReceivers {
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub timers: mpsc::UnboundedReceiver<TimerEvent>,
}

impl TransportContext {
    /// Create a context and the receivers for session events and timers.
    pub fn new(
        config: TransportConfig,
        caps: Arc<dyn CapabilityCache>,
        presences: Arc<dyn PresenceOracle>,
        roster: Arc<dyn RosterManager>,
        channel: Arc<dyn StanzaChannel>,
    ) -> (Self, SessionReceivers) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (timers, timers_rx) = mpsc::unbounded_channel();
        let context = Self {
            config: Arc::new(config),
            caps,
            presences,
            roster,
            channel,
            events,
            timers,
        };
        (
            context,
            SessionReceivers {
                events: events_rx,
                timers: timers_rx,
            },
        )
    }

    /// Gateway address as a full `Jid`.
    pub fn gateway_jid(&self) -> Jid {
        Jid::from(self.config.jid.clone())
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Session of one bare identity.
pub struct UserSession {
    jid: BareJid,
    user_info: UserInfo,
    settings: UserSettings,
    ctx: TransportContext,
    connected: bool,
    /// Monotonic for the lifetime of the session
    ready_for_connect: bool,
    ignore_disconnect: bool,
    /// Available resources seen at the last bare presence
    resources: usize,
    reconnect_attempts: u32,
    cache_messages: bool,
    /// Room joins to replay once the backend is connected
    joined_rooms: Vec<Presence>,
    /// Capabilities the shared cache could not resolve
    legacy_caps: HashMap<Jid, CachedDiscoInfo>,
    conversations: ConversationManager,
    caps_timer: Option<JoinHandle<()>>,
    timer_generation: u64,
    last_activity: DateTime<Utc>,
}

impl UserSession {
    /// Create a session for a registered user.
    pub fn new(
        jid: BareJid,
        user_info: UserInfo,
        settings: UserSettings,
        ctx: TransportContext,
    ) -> Self {
        info!(jid = %jid, "Created user session");
        Self {
            conversations: ConversationManager::new(jid.clone()),
            jid,
            user_info,
            settings,
            ctx,
            connected: false,
            ready_for_connect: false,
            ignore_disconnect: false,
            resources: 0,
            reconnect_attempts: 0,
            cache_messages: false,
            joined_rooms: Vec::new(),
            legacy_caps: HashMap::new(),
            caps_timer: None,
            timer_generation: 0,
            last_activity: Utc::now(),
        }
    }

    /// Handle a front-end presence from one of the user's resources.
    ///
    /// `force_join` replays room joins that already have a conversation, as
    /// happens when pending joins are replayed after connecting.
    pub fn handle_presence(&mut self, presence: Presence, force_join: bool) {
        let Some(from) = presence.from.clone() else {
            warn!(jid = %self.jid, "Dropping presence without sender");
            return;
        };
        debug!(jid = %self.jid, from = %from, to = ?presence.to, type_ = ?presence.type_, "Presence");

        if !self.connected && !self.ready_for_connect {
            self.check_readiness(&from, &presence);
        }

        if let Some(to) = presence.to.clone().filter(|to| to.node().is_some()) {
            if is_unavailable(&presence) {
                self.handle_room_leave(presence, &from, &to);
                return;
            }
            if is_room_presence(&presence, &to) {
                self.handle_room_join(presence, &from, &to, force_join);
                return;
            }
            self.ctx.emit(SessionEvent::RawPresence {
                jid: self.jid.clone(),
                presence: Box::new(presence.clone()),
            });
        }

        self.handle_resource_presence(&presence, &from);
    }

    fn check_readiness(&mut self, from: &Jid, presence: &Presence) {
        match extract_caps(presence) {
            Some(caps) if caps.is_supported() => {
                self.ctx.caps.note_advertised(from, &caps);
                if self.ctx.caps.has_caps(from) {
                    self.mark_ready();
                } else {
                    debug!(jid = %self.jid, ver = %caps.ver, "Capabilities not cached yet");
                    self.start_caps_timer();
                }
            }
            Some(caps) => {
                debug!(jid = %self.jid, hash = ?caps.hash, "Unsupported capabilities hash");
                self.mark_ready();
            }
            None if self.ctx.config.mode.is_server() => self.mark_ready(),
            None => self.start_caps_timer(),
        }
    }

    fn mark_ready(&mut self) {
        self.stop_caps_timer();
        self.ready_for_connect = true;
        info!(jid = %self.jid, "Ready to be connected to legacy network");
        self.ctx.emit(SessionEvent::ReadyToConnect {
            jid: self.jid.clone(),
        });
    }

    fn handle_room_leave(&mut self, presence: Presence, from: &Jid, to: &Jid) {
        let Some(room) = legacy_name(to) else {
            return;
        };
        let Some(conversation) = self.conversations.get_mut(&room) else {
            // A leave cancels a join still waiting for the backend
            let pending = self.joined_rooms.len();
            self.joined_rooms
                .retain(|p| p.to.as_ref() != Some(to) || p.from.as_ref() != Some(from));
            if self.joined_rooms.len() < pending {
                info!(jid = %self.jid, room = %room, "Dropped postponed room join");
            } else {
                debug!(jid = %self.jid, room = %room, "Leave for unknown room");
            }
            return;
        };

        conversation.remove_participant(from);
        if conversation.participant_count() > 0 {
            debug!(jid = %self.jid, room = %room, remaining = conversation.participant_count(), "Resource left room");
            return;
        }
        if self.settings.stay_connected {
            debug!(jid = %self.jid, room = %room, "Keeping empty room for sticky session");
            return;
        }

        info!(jid = %self.jid, room = %room, "Leaving room");
        self.ctx.emit(SessionEvent::RawPresence {
            jid: self.jid.clone(),
            presence: Box::new(presence),
        });
        self.ctx.emit(SessionEvent::RoomLeft {
            jid: self.jid.clone(),
            room: room.clone(),
        });
        self.joined_rooms.retain(|p| p.to.as_ref() != Some(to));
        self.conversations.remove(&room);
    }

    fn handle_room_join(&mut self, presence: Presence, from: &Jid, to: &Jid, force_join: bool) {
        // A room join is enough to connect; the backend handles auto-join.
        if !self.ready_for_connect {
            self.mark_ready();
        }

        let Some(room) = legacy_name(to) else {
            return;
        };
        let nickname = resource_of(to).unwrap_or_default();
        let password = muc_password(&presence);

        if let Some(conversation) = self.conversations.get_mut(&room) {
            if conversation.has_participant(from) {
                info!(jid = %self.jid, room = %room, nick = %nickname, "Resource already joined room");
            } else {
                conversation.add_participant(from.clone());
                for participant in conversation.participant_presences(from) {
                    self.ctx.channel.send_presence(participant);
                }
                for message in conversation.history_for(from) {
                    self.ctx.channel.send_message(message);
                }
            }

            if force_join {
                self.ctx.emit(SessionEvent::RawPresence {
                    jid: self.jid.clone(),
                    presence: Box::new(presence),
                });
                self.ctx.emit(SessionEvent::RoomJoined {
                    jid: self.jid.clone(),
                    from: from.clone(),
                    room,
                    nickname,
                    password,
                });
            }
            return;
        }

        if !self.joined_rooms.iter().any(|p| p.to == presence.to) {
            self.joined_rooms.push(presence.clone());
        }

        if !self.connected {
            info!(jid = %self.jid, room = %room, "Joining room postponed until connected");
            return;
        }

        info!(jid = %self.jid, room = %room, nick = %nickname, "Joining room");
        let mut conversation = Conversation::new(
            room.as_str(),
            to.to_bare(),
            true,
            self.ctx.config.history_limit,
        );
        conversation.set_nickname(nickname.as_str());
        conversation.add_participant(from.clone());
        if let Err(e) = self.conversations.add(conversation) {
            warn!(jid = %self.jid, room = %room, error = %e, "Failed to register room");
            return;
        }

        self.ctx.emit(SessionEvent::RawPresence {
            jid: self.jid.clone(),
            presence: Box::new(presence),
        });
        self.ctx.emit(SessionEvent::RoomJoined {
            jid: self.jid.clone(),
            from: from.clone(),
            room,
            nickname,
            password,
        });
    }

    fn handle_resource_presence(&mut self, presence: &Presence, from: &Jid) {
        let all = self.ctx.presences.all_presences(&self.jid);
        let current_resources = all.iter().filter(|p| !is_unavailable(p)).count();

        self.conversations.reset_resources();

        if is_unavailable(presence) {
            let emptied = self.conversations.remove_participant(from);
            if !self.settings.stay_connected {
                for room in emptied {
                    info!(jid = %self.jid, room = %room, "Last joined resource gone, leaving room");
                    self.ctx.emit(SessionEvent::RoomLeft {
                        jid: self.jid.clone(),
                        room: room.clone(),
                    });
                    self.joined_rooms
                        .retain(|p| p.to.as_ref().and_then(legacy_name).as_deref() != Some(room.as_str()));
                    self.conversations.remove(&room);
                }
            }

            if current_resources > 0 {
                info!(jid = %self.jid, resources = current_resources, "User is still connected from other clients");
            } else {
                info!(jid = %self.jid, "Last client disconnected");
                self.ctx.emit(SessionEvent::LastResourceGone {
                    jid: self.jid.clone(),
                });
            }
        }

        if !self.ctx.config.mode.is_server() {
            if is_unavailable(presence) {
                self.ctx.roster.send_unavailable_presences(from);
                self.ctx
                    .channel
                    .send_presence(build_unavailable(self.ctx.gateway_jid(), from.clone(), None));
            } else {
                self.send_current_presence();
            }
        }

        // A new resource needs the contact list presences
        if !is_unavailable(presence) && current_resources > self.resources {
            self.ctx.roster.send_current_presences(from);
        }
        self.resources = current_resources;

        if self.ready_for_connect {
            self.update_backend_presence();
        }
    }

    fn update_backend_presence(&mut self) {
        match self.ctx.presences.highest_priority_presence(&self.jid) {
            Some(highest) if !is_unavailable(&highest) => {
                info!(jid = %self.jid, show = ?highest.show, "Changing legacy network presence");
                self.ctx.emit(SessionEvent::PresenceChanged {
                    jid: self.jid.clone(),
                    presence: Box::new(highest),
                });
                self.set_cache_messages(false);
            }
            highest if self.settings.stay_connected => {
                if self.settings.xa_when_offline {
                    let mut xa = highest.unwrap_or_else(|| Presence::new(PresenceType::None));
                    xa.type_ = PresenceType::None;
                    xa.show = Some(Show::Xa);
                    self.ctx.emit(SessionEvent::RawPresence {
                        jid: self.jid.clone(),
                        presence: Box::new(xa),
                    });
                }
                info!(jid = %self.jid, "All resources gone, keeping legacy connection");
                self.resources = 0;
                self.conversations.clear_participants();
                self.set_cache_messages(true);
            }
            Some(highest) => {
                info!(jid = %self.jid, "Changing legacy network presence to unavailable");
                self.ctx.emit(SessionEvent::PresenceChanged {
                    jid: self.jid.clone(),
                    presence: Box::new(highest),
                });
            }
            None => {
                info!(jid = %self.jid, "Changing legacy network presence to unavailable");
                let unavailable = build_unavailable(
                    self.ctx.gateway_jid(),
                    Jid::from(self.jid.clone()),
                    None,
                );
                self.ctx.emit(SessionEvent::PresenceChanged {
                    jid: self.jid.clone(),
                    presence: Box::new(unavailable),
                });
            }
        }
    }

    /// Send the gateway's own presence to every available resource.
    pub fn send_current_presence(&self) {
        if self.ctx.config.mode.is_server() {
            return;
        }

        let highest = if self.connected {
            self.ctx.presences.highest_priority_presence(&self.jid)
        } else {
            None
        };

        for presence in self.ctx.presences.all_presences(&self.jid) {
            if is_unavailable(&presence) {
                continue;
            }
            let Some(to) = presence.from else {
                continue;
            };

            let response = match (&highest, self.connected) {
                (Some(highest), true) => {
                    let mut response = highest.clone();
                    response.from = Some(self.ctx.gateway_jid());
                    response.to = Some(to);
                    response
                }
                (None, true) => build_unavailable(self.ctx.gateway_jid(), to, None),
                (_, false) => build_unavailable(self.ctx.gateway_jid(), to, Some(CONNECTING_STATUS)),
            };
            self.ctx.channel.send_presence(response);
        }
    }

    /// Handle a disco#info answer for one of the user's resources.
    pub fn on_capabilities_discovered(&mut self, address: &Jid, info: CachedDiscoInfo) {
        info!(jid = %self.jid, address = %address, "Got disco#info");
        let resolved = self.ctx.caps.has_caps(address) || self.ctx.caps.learn(address, &info);
        if self.ctx.config.legacy_caps && !resolved {
            debug!(jid = %self.jid, address = %address, "Storing legacy capabilities");
            self.legacy_caps.insert(address.clone(), info);
        }
        self.on_capability_wait_timeout();
    }

    /// Force readiness when capabilities did not arrive in time.
    pub fn on_capability_wait_timeout(&mut self) {
        if self.connected || self.ready_for_connect {
            return;
        }
        self.mark_ready();

        if let Some(highest) = self.ctx.presences.highest_priority_presence(&self.jid) {
            info!(jid = %self.jid, type_ = ?highest.type_, "Changing legacy network presence");
            self.ctx.emit(SessionEvent::PresenceChanged {
                jid: self.jid.clone(),
                presence: Box::new(highest),
            });
        }
    }

    /// Handle a timer expiration. Stale timers are ignored.
    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::CapsWaitElapsed { jid, generation } => {
                if jid != self.jid || generation != self.timer_generation {
                    debug!(jid = %self.jid, generation, "Ignoring stale capability timer");
                    return;
                }
                self.caps_timer = None;
                debug!(jid = %self.jid, "Capability wait elapsed");
                self.on_capability_wait_timeout();
            }
        }
    }

    fn start_caps_timer(&mut self) {
        self.stop_caps_timer();
        self.timer_generation += 1;

        let Ok(handle) = Handle::try_current() else {
            warn!(jid = %self.jid, "No runtime, capability wait timer not started");
            return;
        };

        let jid = self.jid.clone();
        let generation = self.timer_generation;
        let wait = self.ctx.config.caps_wait;
        let timers = self.ctx.timers.clone();
        self.caps_timer = Some(handle.spawn(async move {
            tokio::time::sleep(wait).await;
            if timers
                .send(TimerEvent::CapsWaitElapsed { jid, generation })
                .is_err()
            {
                debug!("Timer receiver dropped");
            }
        }));
        debug!(jid = %self.jid, generation, wait_ms = wait.as_millis() as u64, "Started capability wait timer");
    }

    fn stop_caps_timer(&mut self) {
        if let Some(timer) = self.caps_timer.take() {
            timer.abort();
        }
    }

    /// Record the backend connection state.
    pub fn set_connected(&mut self, connected: bool) {
        if connected && !self.ready_for_connect {
            warn!(jid = %self.jid, "Connected before being ready, marking ready");
            self.stop_caps_timer();
            self.ready_for_connect = true;
        }

        self.connected = connected;
        self.reconnect_attempts = 0;
        self.set_ignore_disconnect(false);
        self.last_activity = Utc::now();

        self.send_current_presence();

        if self.connected {
            let pending = self.joined_rooms.clone();
            for presence in pending {
                self.handle_presence(presence, true);
            }
        }
    }

    /// Handle the backend connection going down.
    pub fn handle_disconnected(&mut self, reason: &str, kind: BackendErrorKind) -> DisconnectOutcome {
        if self.ignore_disconnect {
            info!(jid = %self.jid, "Disconnect ignored, probably moving between backends");
            return DisconnectOutcome::Ignored;
        }

        if kind.is_transient() && self.reconnect_attempts < self.ctx.config.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            info!(
                jid = %self.jid,
                reason = %reason,
                attempt = self.reconnect_attempts,
                "Disconnected from legacy network, reconnecting automatically"
            );
            self.reset_for_retry();
            self.ctx.emit(SessionEvent::ReadyToConnect {
                jid: self.jid.clone(),
            });
            return DisconnectOutcome::Retrying {
                attempt: self.reconnect_attempts,
            };
        }

        if reason.is_empty() {
            info!(jid = %self.jid, "Disconnected from legacy network");
        } else {
            info!(jid = %self.jid, reason = %reason, kind = %kind, "Disconnected from legacy network with error");
        }
        self.ctx.emit(SessionEvent::Disconnected {
            jid: self.jid.clone(),
            reason: reason.to_string(),
            kind,
        });

        let mut message = Message::new(Some(Jid::from(self.jid.clone())));
        message.from = Some(self.ctx.gateway_jid());
        message.bodies.insert(String::new(), Body(reason.to_string()));
        message.payloads.push(kind.to_element());
        self.ctx.channel.send_message(message);

        DisconnectOutcome::Terminated
    }

    /// Clear connection state ahead of a silent reconnect.
    ///
    /// Identity, readiness, conversations, pending joins and the retry
    /// counter survive.
    pub fn reset_for_retry(&mut self) {
        self.connected = false;
        self.ignore_disconnect = false;
    }

    /// Suppress the next disconnect (backend hand-off).
    pub fn set_ignore_disconnect(&mut self, ignore: bool) {
        self.ignore_disconnect = ignore;
        debug!(jid = %self.jid, ignore_disconnect = ignore, "Set ignore disconnect");
    }

    /// Toggle message caching; turning it off flushes held messages.
    pub fn set_cache_messages(&mut self, cache: bool) {
        let flush = self.cache_messages && !cache;
        self.cache_messages = cache;
        if !flush {
            return;
        }

        for conversation in self.conversations.iter_mut() {
            for message in conversation.take_cached() {
                deliver(conversation, &self.jid, self.ctx.channel.as_ref(), message);
            }
        }
    }

    /// Route a message from the legacy network to the user's resources.
    ///
    /// One-to-one conversations are created on demand; messages for rooms
    /// the user is not in are dropped.
    pub fn deliver_legacy_message(&mut self, peer: &str, is_group: bool, mut message: Message) {
        if !self.conversations.contains(peer) {
            if is_group {
                warn!(jid = %self.jid, room = %peer, "Dropping message for unknown room");
                return;
            }
            let address = match gateway_address(peer, &self.ctx.config.jid) {
                Ok(address) => address,
                Err(e) => {
                    warn!(jid = %self.jid, peer = %peer, error = %e, "Dropping message from unaddressable peer");
                    return;
                }
            };
            let conversation = Conversation::new(peer, address, false, self.ctx.config.history_limit);
            if let Err(e) = self.conversations.add(conversation) {
                warn!(jid = %self.jid, peer = %peer, error = %e, "Failed to open conversation");
                return;
            }
        }

        let Some(conversation) = self.conversations.get_mut(peer) else {
            return;
        };
        if message.from.is_none() {
            message.from = Some(Jid::from(conversation.jid().clone()));
        }
        if conversation.is_group() {
            message.type_ = MessageType::Groupchat;
        }

        if self.cache_messages {
            debug!(jid = %self.jid, peer = %peer, "Caching message");
            conversation.cache_message(message);
            return;
        }
        deliver(conversation, &self.jid, self.ctx.channel.as_ref(), message);
    }

    /// Update a legacy-side room participant and tell the joined resources.
    pub fn handle_participant_changed(&mut self, room: &str, occupant: Occupant, available: bool) {
        let Some(conversation) = self.conversations.get_mut(room) else {
            debug!(jid = %self.jid, room = %room, "Participant change for unknown room");
            return;
        };

        let from = match format!("{}/{}", conversation.jid(), occupant.nick).parse::<Jid>() {
            Ok(from) => from,
            Err(e) => {
                warn!(jid = %self.jid, room = %room, nick = %occupant.nick, error = %e, "Invalid participant nickname");
                return;
            }
        };

        let mut presence = if available {
            let mut presence = Presence::new(PresenceType::None);
            presence.show = occupant.show.clone();
            if let Some(ref status) = occupant.status {
                presence.statuses.insert(String::new(), status.clone());
            }
            presence
        } else {
            Presence::new(PresenceType::Unavailable)
        };
        presence.from = Some(from);

        if available {
            conversation.set_occupant(occupant);
        } else {
            conversation.remove_occupant(&occupant.nick);
        }

        for target in conversation.participants() {
            let mut addressed = presence.clone();
            addressed.to = Some(target.clone());
            self.ctx.channel.send_presence(addressed);
        }
    }

    /// Remember which resource last wrote to a one-to-one peer.
    pub fn note_active_resource(&mut self, peer: &str, resource: Jid) {
        match self.conversations.get_mut(peer) {
            Some(conversation) if !conversation.is_group() => {
                conversation.set_active_resource(resource);
            }
            _ => {}
        }
    }

    /// Capabilities of `address`, from the shared cache or the legacy fallback.
    pub fn caps_for(&self, address: &Jid) -> Option<CachedDiscoInfo> {
        self.ctx.caps.caps_for(address).or_else(|| {
            if self.ctx.config.legacy_caps {
                self.legacy_caps.get(address).cloned()
            } else {
                None
            }
        })
    }

    /// Available resources advertising `feature`.
    pub fn jids_with_feature(&self, feature: &str) -> Vec<Jid> {
        let jids: Vec<Jid> = self
            .ctx
            .presences
            .all_presences(&self.jid)
            .into_iter()
            .filter(|p| !is_unavailable(p))
            .filter_map(|p| p.from)
            .filter(|from| {
                self.caps_for(from)
                    .map(|info| info.has_feature(feature))
                    .unwrap_or(false)
            })
            .collect();

        if jids.is_empty() {
            debug!(jid = %self.jid, feature = %feature, "No resource with feature");
        }
        jids
    }

    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    pub fn user_info(&self) -> &UserInfo {
        &self.user_info
    }

    pub fn settings(&self) -> UserSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: UserSettings) {
        self.settings = settings;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_ready_for_connect(&self) -> bool {
        self.ready_for_connect
    }

    pub fn ignores_disconnect(&self) -> bool {
        self.ignore_disconnect
    }

    pub fn resource_count(&self) -> usize {
        self.resources
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn caches_messages(&self) -> bool {
        self.cache_messages
    }

    /// Room joins that will be replayed on connect.
    pub fn joined_rooms(&self) -> &[Presence] {
        &self.joined_rooms
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    pub fn conversations_mut(&mut self) -> &mut ConversationManager {
        &mut self.conversations
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Whether a capability wait timer is armed.
    pub fn has_pending_caps_timer(&self) -> bool {
        self.caps_timer.is_some()
    }
}

impl Drop for UserSession {
    fn drop(&mut self) {
        self.stop_caps_timer();
        info!(jid = %self.jid, "Destroying user session");
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("jid", &self.jid)
            .field("connected", &self.connected)
            .field("ready_for_connect", &self.ready_for_connect)
            .field("resources", &self.resources)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("conversations", &self.conversations.len())
            .finish_non_exhaustive()
    }
}

/// Send `message` to every delivery target of `conversation`.
fn deliver(
    conversation: &mut Conversation,
    owner: &BareJid,
    channel: &dyn StanzaChannel,
    message: Message,
) {
    for target in conversation.delivery_targets(owner) {
        let mut addressed = message.clone();
        addressed.to = Some(target);
        channel.send_message(addressed);
    }
    if conversation.is_group() {
        conversation.push_history(message);
    }
}
