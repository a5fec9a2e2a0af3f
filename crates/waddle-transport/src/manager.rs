//! User session registry and front-end event loop.
//!
//! The [`UserManager`] owns every [`UserSession`], keyed by bare identity,
//! and is the single place events for a user are dispatched from. Events for
//! one identity are therefore handled strictly in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use jid::{BareJid, Jid};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::caps::CachedDiscoInfo;
use crate::presence::{is_bare_directed, is_unavailable};
use crate::session::{DisconnectOutcome, TimerEvent, TransportContext, UserSession};
use crate::storage::StorageBackend;
use crate::BackendErrorKind;

/// Input to the user manager.
#[derive(Debug, Clone)]
pub enum FrontendEvent {
    /// Presence from a front-end resource (already recorded by the aggregator)
    Presence(Box<Presence>),
    /// disco#info answer for a resource
    CapabilitiesDiscovered { address: Jid, info: CachedDiscoInfo },
    /// The backend connection of `jid` came up
    BackendConnected { jid: BareJid },
    /// The backend connection of `jid` went down
    BackendDisconnected {
        jid: BareJid,
        reason: String,
        kind: BackendErrorKind,
    },
}

/// Registration changes observers of the registry care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserManagerEvent {
    UserCreated { jid: BareJid },
    UserDestroyed { jid: BareJid },
}

/// Registry of active user sessions.
pub struct UserManager {
    ctx: TransportContext,
    storage: Arc<dyn StorageBackend>,
    sessions: HashMap<BareJid, UserSession>,
    events: mpsc::UnboundedSender<UserManagerEvent>,
}

impl UserManager {
    /// Create a registry and the receiver for its registration events.
    pub fn new(
        ctx: TransportContext,
        storage: Arc<dyn StorageBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<UserManagerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                storage,
                sessions: HashMap::new(),
                events,
            },
            events_rx,
        )
    }

    /// Process front-end events and timers until shutdown.
    pub async fn run(
        &mut self,
        mut frontend: mpsc::UnboundedReceiver<FrontendEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerEvent>,
        shutdown: CancellationToken,
    ) {
        info!("User manager started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("User manager shutting down");
                    break;
                }
                Some(event) = frontend.recv() => self.handle_event(event).await,
                Some(timer) = timers.recv() => self.handle_timer(timer),
                else => break,
            }
        }
    }

    /// Dispatch one front-end event.
    pub async fn handle_event(&mut self, event: FrontendEvent) {
        match event {
            FrontendEvent::Presence(presence) => self.handle_presence(*presence).await,
            FrontendEvent::CapabilitiesDiscovered { address, info } => {
                self.handle_capabilities(&address, info)
            }
            FrontendEvent::BackendConnected { jid } => self.handle_connected(&jid),
            FrontendEvent::BackendDisconnected { jid, reason, kind } => {
                self.handle_disconnected(&jid, &reason, kind).await
            }
        }
    }

    /// Route a front-end presence, creating the session on first availability.
    #[instrument(skip(self, presence), fields(from = ?presence.from))]
    pub async fn handle_presence(&mut self, presence: Presence) {
        let Some(from) = presence.from.clone() else {
            warn!("Dropping presence without sender");
            return;
        };
        if !matches!(presence.type_, PresenceType::None | PresenceType::Unavailable) {
            debug!(type_ = ?presence.type_, "Not an availability presence");
            return;
        }
        let bare = from.to_bare();

        if !self.sessions.contains_key(&bare) {
            if is_unavailable(&presence) {
                debug!(jid = %bare, "Unavailable presence for user without session");
                return;
            }
            if !self.create_session(&bare).await {
                return;
            }
        }

        // Room and peer presence never ends a resource
        let resource_gone = is_unavailable(&presence) && is_bare_directed(&presence);
        let Some(session) = self.sessions.get_mut(&bare) else {
            return;
        };
        session.handle_presence(presence, false);

        let gone = self
            .ctx
            .presences
            .all_presences(&bare)
            .iter()
            .all(is_unavailable);
        if resource_gone && gone && !session.settings().stay_connected {
            info!(jid = %bare, "All resources gone, removing user");
            self.remove_user(&bare).await;
        }
    }

    async fn create_session(&mut self, jid: &BareJid) -> bool {
        let user = match self.storage.get_user(&jid.to_string()).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                info!(jid = %jid, "Presence from unregistered user");
                return false;
            }
            Err(e) => {
                error!(jid = %jid, error = %e, "Failed to load user");
                return false;
            }
        };

        let settings = match self.storage.load_settings(user.id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(jid = %jid, error = %e, "Failed to load user settings, using defaults");
                Default::default()
            }
        };

        if let Err(e) = self.storage.set_user_online(user.id, true).await {
            warn!(jid = %jid, error = %e, "Failed to mark user online");
        }

        let session = UserSession::new(jid.clone(), user, settings, self.ctx.clone());
        self.sessions.insert(jid.clone(), session);
        self.emit(UserManagerEvent::UserCreated { jid: jid.clone() });
        true
    }

    /// Hand a disco#info answer to the owning session.
    pub fn handle_capabilities(&mut self, address: &Jid, info: CachedDiscoInfo) {
        match self.sessions.get_mut(&address.to_bare()) {
            Some(session) => session.on_capabilities_discovered(address, info),
            None => debug!(address = %address, "disco#info for user without session"),
        }
    }

    /// Mark the backend connection of `jid` as up.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn handle_connected(&mut self, jid: &BareJid) {
        match self.sessions.get_mut(jid) {
            Some(session) => session.set_connected(true),
            None => warn!("Backend connected for user without session"),
        }
    }

    /// Handle the backend connection of `jid` going down.
    #[instrument(skip(self), fields(jid = %jid))]
    pub async fn handle_disconnected(&mut self, jid: &BareJid, reason: &str, kind: BackendErrorKind) {
        let Some(session) = self.sessions.get_mut(jid) else {
            debug!("Backend disconnected for user without session");
            return;
        };

        match session.handle_disconnected(reason, kind) {
            DisconnectOutcome::Ignored => {}
            DisconnectOutcome::Retrying { attempt } => {
                debug!(attempt, "Re-registering user for reconnect");
                self.emit(UserManagerEvent::UserDestroyed { jid: jid.clone() });
                self.emit(UserManagerEvent::UserCreated { jid: jid.clone() });
            }
            DisconnectOutcome::Terminated => {
                if self.ctx.config.mode.is_server() {
                    self.ctx.channel.finish_session(jid, Some(reason));
                }
                self.destroy_session(jid).await;
            }
        }
    }

    /// Route a timer expiration to its session.
    pub fn handle_timer(&mut self, event: TimerEvent) {
        let jid = match &event {
            TimerEvent::CapsWaitElapsed { jid, .. } => jid.clone(),
        };
        match self.sessions.get_mut(&jid) {
            Some(session) => session.handle_timer(event),
            None => debug!(jid = %jid, "Timer for removed session"),
        }
    }

    /// Remove a user's session.
    ///
    /// Returns `false` if no session existed.
    #[instrument(skip(self), fields(jid = %jid))]
    pub async fn remove_user(&mut self, jid: &BareJid) -> bool {
        if !self.sessions.contains_key(jid) {
            return false;
        }
        if self.ctx.config.mode.is_server() {
            self.ctx.channel.finish_session(jid, None);
        }
        self.destroy_session(jid).await;
        true
    }

    async fn destroy_session(&mut self, jid: &BareJid) {
        let Some(session) = self.sessions.remove(jid) else {
            return;
        };
        if let Err(e) = self
            .storage
            .set_user_online(session.user_info().id, false)
            .await
        {
            warn!(jid = %jid, error = %e, "Failed to mark user offline");
        }
        drop(session);
        self.emit(UserManagerEvent::UserDestroyed { jid: jid.clone() });
    }

    pub fn get(&self, jid: &BareJid) -> Option<&UserSession> {
        self.sessions.get(jid)
    }

    pub fn get_mut(&mut self, jid: &BareJid) -> Option<&mut UserSession> {
        self.sessions.get_mut(jid)
    }

    pub fn contains(&self, jid: &BareJid) -> bool {
        self.sessions.contains_key(jid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn emit(&self, event: UserManagerEvent) {
        if self.events.send(event).is_err() {
            debug!("User manager event receiver dropped");
        }
    }
}

impl std::fmt::Debug for UserManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserManager")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
