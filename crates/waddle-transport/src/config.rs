//! Transport configuration.
//!
//! Loaded from `WADDLE_TRANSPORT_*` environment variables, falling back to
//! defaults for anything unset.
//!
//! # Environment Variables
//!
//! - `WADDLE_TRANSPORT_JID`: Gateway component address. Default: `transport.localhost`
//! - `WADDLE_TRANSPORT_MODE`: `component` or `server`. Default: `component`
//! - `WADDLE_TRANSPORT_RECONNECT_ON_START`: Reconnect every registered user at
//!   startup instead of probing previously online users. Default: `false`
//! - `WADDLE_TRANSPORT_CAPS_WAIT_MS`: Capability-wait timeout. Default: `5000`
//! - `WADDLE_TRANSPORT_RECONNECT_INTERVAL_MS`: Startup reconnection pacing. Default: `1000`
//! - `WADDLE_TRANSPORT_MAX_RECONNECT_ATTEMPTS`: Silent retries on network errors. Default: `3`
//! - `WADDLE_TRANSPORT_LEGACY_CAPS`: Keep a per-session fallback for capabilities
//!   the shared cache does not recognise. Default: `true`
//! - `WADDLE_TRANSPORT_HISTORY_LIMIT`: Room history kept per conversation. Default: `20`

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use jid::BareJid;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::TransportError;

/// Default capability-wait timeout in milliseconds.
pub const DEFAULT_CAPS_WAIT_MS: u64 = 5000;

/// Default interval between two scheduled reconnections in milliseconds.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1000;

/// Default number of silent reconnect attempts after a network error.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default number of room messages kept for replay to joining resources.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// How the gateway is attached to the XMPP network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// External component behind an XMPP server.
    ///
    /// Sessions wait for capabilities before connecting and the gateway
    /// mirrors availability back to each resource.
    #[default]
    Component,

    /// The gateway is the XMPP server itself.
    ///
    /// Sessions are ready as soon as the first presence arrives, the backend
    /// drives presence shape, and the front end finishes client sessions.
    Server,
}

impl GatewayMode {
    /// Check if this is server mode.
    pub fn is_server(&self) -> bool {
        matches!(self, GatewayMode::Server)
    }
}

impl fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayMode::Component => write!(f, "component"),
            GatewayMode::Server => write!(f, "server"),
        }
    }
}

impl FromStr for GatewayMode {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "component" => Ok(GatewayMode::Component),
            "server" => Ok(GatewayMode::Server),
            other => Err(TransportError::config(format!(
                "unknown gateway mode '{other}'"
            ))),
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Gateway component address (e.g. "icq.example.com")
    pub jid: BareJid,
    /// Attachment mode
    pub mode: GatewayMode,
    /// Reconnect all registered users with `stay_connected` at startup,
    /// instead of probing users that were online at shutdown
    pub reconnect_on_start: bool,
    /// How long to wait for capabilities before forcing readiness
    pub caps_wait: Duration,
    /// Pacing of the startup reconnection scheduler
    pub reconnect_interval: Duration,
    /// Silent retries after transient backend errors
    pub max_reconnect_attempts: u32,
    /// Keep a per-session capability fallback for unknown hash schemes
    pub legacy_caps: bool,
    /// Room messages cached per conversation
    pub history_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            jid: BareJid::new("transport.localhost").expect("static domain JID is valid"),
            mode: GatewayMode::default(),
            reconnect_on_start: false,
            caps_wait: Duration::from_millis(DEFAULT_CAPS_WAIT_MS),
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            legacy_caps: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, TransportError> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        info!(
            jid = %config.jid,
            mode = %config.mode,
            reconnect_on_start = config.reconnect_on_start,
            "Transport configuration loaded"
        );

        Ok(config)
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TransportError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(jid) = lookup("WADDLE_TRANSPORT_JID") {
            config.jid = BareJid::new(&jid).map_err(|e| TransportError::invalid_jid(&jid, e))?;
        }
        if let Some(mode) = lookup("WADDLE_TRANSPORT_MODE") {
            config.mode = mode.parse()?;
        }
        if let Some(value) = lookup("WADDLE_TRANSPORT_RECONNECT_ON_START") {
            config.reconnect_on_start = parse_bool("WADDLE_TRANSPORT_RECONNECT_ON_START", &value)?;
        }
        if let Some(value) = lookup("WADDLE_TRANSPORT_CAPS_WAIT_MS") {
            config.caps_wait =
                Duration::from_millis(parse_number("WADDLE_TRANSPORT_CAPS_WAIT_MS", &value)?);
        }
        if let Some(value) = lookup("WADDLE_TRANSPORT_RECONNECT_INTERVAL_MS") {
            config.reconnect_interval = Duration::from_millis(parse_number(
                "WADDLE_TRANSPORT_RECONNECT_INTERVAL_MS",
                &value,
            )?);
        }
        if let Some(value) = lookup("WADDLE_TRANSPORT_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts =
                parse_number("WADDLE_TRANSPORT_MAX_RECONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("WADDLE_TRANSPORT_LEGACY_CAPS") {
            config.legacy_caps = parse_bool("WADDLE_TRANSPORT_LEGACY_CAPS", &value)?;
        }
        if let Some(value) = lookup("WADDLE_TRANSPORT_HISTORY_LIMIT") {
            config.history_limit = parse_number("WADDLE_TRANSPORT_HISTORY_LIMIT", &value)?;
        }

        Ok(config)
    }
}

/// Parse a boolean setting. Accepts the `"1"`/`"0"` form used by stored user settings.
pub(crate) fn parse_bool(key: &str, value: &str) -> Result<bool, TransportError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(TransportError::config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, TransportError> {
    value
        .trim()
        .parse()
        .map_err(|_| TransportError::config(format!("{key}: expected a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.jid.to_string(), "transport.localhost");
        assert_eq!(config.mode, GatewayMode::Component);
        assert!(!config.reconnect_on_start);
        assert_eq!(config.caps_wait, Duration::from_millis(5000));
        assert_eq!(config.reconnect_interval, Duration::from_millis(1000));
        assert_eq!(config.max_reconnect_attempts, 3);
        assert!(config.legacy_caps);
    }

    #[test]
    fn test_overrides() {
        let config = TransportConfig::from_lookup(lookup_from(&[
            ("WADDLE_TRANSPORT_JID", "icq.example.com"),
            ("WADDLE_TRANSPORT_MODE", "Server"),
            ("WADDLE_TRANSPORT_RECONNECT_ON_START", "1"),
            ("WADDLE_TRANSPORT_CAPS_WAIT_MS", "250"),
            ("WADDLE_TRANSPORT_MAX_RECONNECT_ATTEMPTS", "5"),
            ("WADDLE_TRANSPORT_LEGACY_CAPS", "off"),
        ]))
        .unwrap();

        assert_eq!(config.jid.to_string(), "icq.example.com");
        assert!(config.mode.is_server());
        assert!(config.reconnect_on_start);
        assert_eq!(config.caps_wait, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(!config.legacy_caps);
    }

    #[test]
    fn test_invalid_values() {
        let result = TransportConfig::from_lookup(lookup_from(&[(
            "WADDLE_TRANSPORT_MODE",
            "gateway",
        )]));
        assert!(matches!(result, Err(TransportError::Config(_))));

        let result = TransportConfig::from_lookup(lookup_from(&[(
            "WADDLE_TRANSPORT_CAPS_WAIT_MS",
            "soon",
        )]));
        assert!(matches!(result, Err(TransportError::Config(_))));

        let result = TransportConfig::from_lookup(lookup_from(&[(
            "WADDLE_TRANSPORT_RECONNECT_ON_START",
            "maybe",
        )]));
        assert!(result.is_err());
    }

    #[test]
    fn test_gateway_mode_display() {
        assert_eq!(GatewayMode::Component.to_string(), "component");
        assert_eq!(GatewayMode::Server.to_string(), "server");
    }
}
