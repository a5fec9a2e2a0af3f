//! Persistent user records and per-user settings.
//!
//! The transport only reads registrations and settings and toggles the
//! "online" flag; registration itself lives elsewhere.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::parse_bool;
use crate::TransportError;

/// Setting key: keep the backend connected when every resource is gone.
pub const SETTING_STAY_CONNECTED: &str = "stay_connected";

/// Setting key: show as extended-away on the backend while sticky and offline.
pub const SETTING_XA_WHEN_OFFLINE: &str = "xa_when_offline";

/// A registered transport user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Storage primary key
    pub id: i64,
    /// Bare JID the user registered with
    pub jid: String,
    /// Account name on the legacy network
    pub legacy_name: String,
    /// Whether the user has VIP status
    pub vip: bool,
}

impl UserInfo {
    /// Create a new user record.
    pub fn new(id: i64, jid: impl Into<String>, legacy_name: impl Into<String>) -> Self {
        Self {
            id,
            jid: jid.into(),
            legacy_name: legacy_name.into(),
            vip: false,
        }
    }
}

/// Settings a session consults while bridging presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserSettings {
    /// Keep the backend link up when all resources go unavailable
    pub stay_connected: bool,
    /// Appear extended-away instead of offline while sticky
    pub xa_when_offline: bool,
}

/// Storage backend for user records.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Look up a registration by bare JID.
    async fn get_user(&self, jid: &str) -> Result<Option<UserInfo>, TransportError>;

    /// Read a raw setting value.
    async fn get_user_setting(&self, user_id: i64, key: &str)
        -> Result<Option<String>, TransportError>;

    /// Every registered bare JID.
    async fn get_all_users(&self) -> Result<Vec<String>, TransportError>;

    /// Bare JIDs marked online at the last shutdown.
    async fn get_online_users(&self) -> Result<Vec<String>, TransportError>;

    /// Mark a user online or offline.
    async fn set_user_online(&self, user_id: i64, online: bool) -> Result<(), TransportError>;

    /// Read a boolean setting, falling back to `default` when unset.
    async fn get_bool_setting(
        &self,
        user_id: i64,
        key: &str,
        default: bool,
    ) -> Result<bool, TransportError> {
        match self.get_user_setting(user_id, key).await? {
            Some(value) => parse_bool(key, &value),
            None => Ok(default),
        }
    }

    /// Load the settings a session needs.
    async fn load_settings(&self, user_id: i64) -> Result<UserSettings, TransportError> {
        Ok(UserSettings {
            stay_connected: self
                .get_bool_setting(user_id, SETTING_STAY_CONNECTED, false)
                .await?,
            xa_when_offline: self
                .get_bool_setting(user_id, SETTING_XA_WHEN_OFFLINE, false)
                .await?,
        })
    }
}

/// In-memory storage backend.
///
/// Suitable for tests and single-node development setups.
#[derive(Debug, Default)]
pub struct MemoryStorageBackend {
    users: RwLock<Vec<UserInfo>>,
    settings: RwLock<HashMap<(i64, String), String>>,
    online: RwLock<HashSet<i64>>,
}

impl MemoryStorageBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user.
    pub fn add_user(&self, user: UserInfo) -> Result<(), TransportError> {
        let mut users = self
            .users
            .write()
            .map_err(|_| TransportError::storage("Lock poisoned"))?;
        users.retain(|u| u.jid != user.jid);
        debug!(jid = %user.jid, id = user.id, "Stored user");
        users.push(user);
        Ok(())
    }

    /// Store a raw setting value.
    pub fn set_user_setting(
        &self,
        user_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        self.settings
            .write()
            .map_err(|_| TransportError::storage("Lock poisoned"))?
            .insert((user_id, key.to_string()), value.to_string());
        Ok(())
    }

    /// Check the online flag of a user.
    pub fn is_online(&self, user_id: i64) -> bool {
        self.online
            .read()
            .map(|online| online.contains(&user_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorageBackend {
    async fn get_user(&self, jid: &str) -> Result<Option<UserInfo>, TransportError> {
        let users = self
            .users
            .read()
            .map_err(|_| TransportError::storage("Lock poisoned"))?;
        Ok(users.iter().find(|u| u.jid == jid).cloned())
    }

    async fn get_user_setting(
        &self,
        user_id: i64,
        key: &str,
    ) -> Result<Option<String>, TransportError> {
        let settings = self
            .settings
            .read()
            .map_err(|_| TransportError::storage("Lock poisoned"))?;
        Ok(settings.get(&(user_id, key.to_string())).cloned())
    }

    async fn get_all_users(&self) -> Result<Vec<String>, TransportError> {
        let users = self
            .users
            .read()
            .map_err(|_| TransportError::storage("Lock poisoned"))?;
        Ok(users.iter().map(|u| u.jid.clone()).collect())
    }

    async fn get_online_users(&self) -> Result<Vec<String>, TransportError> {
        let users = self
            .users
            .read()
            .map_err(|_| TransportError::storage("Lock poisoned"))?;
        let online = self
            .online
            .read()
            .map_err(|_| TransportError::storage("Lock poisoned"))?;
        Ok(users
            .iter()
            .filter(|u| online.contains(&u.id))
            .map(|u| u.jid.clone())
            .collect())
    }

    async fn set_user_online(&self, user_id: i64, online: bool) -> Result<(), TransportError> {
        let mut set = self
            .online
            .write()
            .map_err(|_| TransportError::storage("Lock poisoned"))?;
        if online {
            set.insert(user_id);
        } else {
            set.remove(&user_id);
        }
        Ok(())
    }
}
