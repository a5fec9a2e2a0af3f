//! Paced reconnection of users after the gateway link comes up.
//!
//! Reconnecting every user at once would open a burst of backend
//! connections. The scheduler instead feeds one user per tick into the
//! front-end pipeline, either as a synthetic available presence (when
//! reconnect-on-start is enabled) or as a presence probe.

use std::sync::Arc;

use jid::{BareJid, Jid};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::channel::StanzaChannel;
use crate::config::TransportConfig;
use crate::manager::FrontendEvent;
use crate::presence::build_probe;
use crate::storage::{StorageBackend, SETTING_STAY_CONNECTED};

/// Result of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A synthetic available presence was fed for the user
    Reconnected(BareJid),
    /// A presence probe was sent to the user
    Probed(BareJid),
    /// The user was dequeued without action
    Skipped(String),
    /// Nothing was pending
    Drained,
}

/// Startup reconnection scheduler.
pub struct ReconnectScheduler {
    config: Arc<TransportConfig>,
    storage: Arc<dyn StorageBackend>,
    channel: Arc<dyn StanzaChannel>,
    frontend: mpsc::UnboundedSender<FrontendEvent>,
    /// Served newest first
    pending: Vec<String>,
    started: bool,
}

impl ReconnectScheduler {
    pub fn new(
        config: Arc<TransportConfig>,
        storage: Arc<dyn StorageBackend>,
        channel: Arc<dyn StanzaChannel>,
        frontend: mpsc::UnboundedSender<FrontendEvent>,
    ) -> Self {
        Self {
            config,
            storage,
            channel,
            frontend,
            pending: Vec::new(),
            started: false,
        }
    }

    /// Populate the queue after the gateway link came up.
    ///
    /// Returns the number of users enqueued; zero while a previous pass is
    /// still draining.
    pub async fn handle_connected(&mut self) -> usize {
        if self.started {
            return 0;
        }

        info!(reconnect_on_start = self.config.reconnect_on_start, "Starting user reconnecter");
        self.started = true;

        let users = if self.config.reconnect_on_start {
            self.storage.get_all_users().await
        } else {
            self.storage.get_online_users().await
        };

        match users {
            Ok(users) if users.is_empty() => {
                info!("No users to reconnect");
                self.started = false;
                0
            }
            Ok(users) => {
                let count = users.len();
                self.pending.extend(users);
                info!(count, "Users queued for reconnection");
                count
            }
            Err(e) => {
                error!(error = %e, "Failed to load users to reconnect");
                self.started = false;
                0
            }
        }
    }

    /// Serve the next pending user.
    pub async fn reconnect_next(&mut self) -> TickOutcome {
        let Some(jid) = self.pending.pop() else {
            return TickOutcome::Drained;
        };

        let outcome = if self.config.reconnect_on_start {
            self.reconnect_user(jid).await
        } else {
            self.probe_user(jid)
        };

        if self.pending.is_empty() {
            info!("All users reconnected, stopping user reconnecter");
            self.started = false;
        }
        outcome
    }

    async fn reconnect_user(&self, jid: String) -> TickOutcome {
        let user = match self.storage.get_user(&jid).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                info!(jid = %jid, "Unknown user");
                return TickOutcome::Skipped(jid);
            }
            Err(e) => {
                warn!(jid = %jid, error = %e, "Failed to load user");
                return TickOutcome::Skipped(jid);
            }
        };

        match self
            .storage
            .get_bool_setting(user.id, SETTING_STAY_CONNECTED, true)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(jid = %jid, "Skipping user without stay_connected");
                return TickOutcome::Skipped(jid);
            }
            Err(e) => {
                warn!(jid = %jid, error = %e, "Unreadable stay_connected setting");
                return TickOutcome::Skipped(jid);
            }
        }

        let bare = match jid.parse::<BareJid>() {
            Ok(bare) => bare,
            Err(e) => {
                warn!(jid = %jid, error = %e, "Skipping malformed user address");
                return TickOutcome::Skipped(jid);
            }
        };

        info!(jid = %bare, "Reconnecting user");
        let mut presence = Presence::new(PresenceType::None);
        presence.from = Some(Jid::from(bare.clone()));
        presence.to = Some(Jid::from(self.config.jid.clone()));
        if self
            .frontend
            .send(FrontendEvent::Presence(Box::new(presence)))
            .is_err()
        {
            warn!(jid = %bare, "Front-end pipeline closed");
        }
        TickOutcome::Reconnected(bare)
    }

    fn probe_user(&self, jid: String) -> TickOutcome {
        let bare = match jid.parse::<BareJid>() {
            Ok(bare) => bare,
            Err(e) => {
                warn!(jid = %jid, error = %e, "Skipping malformed user address");
                return TickOutcome::Skipped(jid);
            }
        };

        info!(jid = %bare, "Sending probe presence");
        self.channel.send_presence(build_probe(&self.config.jid, &bare));
        TickOutcome::Probed(bare)
    }

    /// Serve link-up notifications and ticks until shutdown.
    ///
    /// The first user of a pass is served right away, the rest one per
    /// `reconnect_interval`. Ticking stops while the queue is empty.
    pub async fn run(&mut self, mut link_up: mpsc::UnboundedReceiver<()>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.reconnect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                up = link_up.recv() => match up {
                    Some(()) => {
                        if self.handle_connected().await > 0 {
                            ticker.reset_immediately();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick(), if !self.pending.is_empty() => {
                    self.reconnect_next().await;
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl std::fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("pending", &self.pending.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
