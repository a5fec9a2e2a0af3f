//! Error types for the transport core.

use thiserror::Error;
use xmpp_parsers::minidom::Element;

/// Namespace of the error payload attached to terminal disconnect messages.
pub const NS_TRANSPORT_ERROR: &str = "urn:waddle:transport:error";

/// Transport core errors.
///
/// Event handlers on [`crate::UserSession`] and [`crate::UserManager`] never
/// return these; they are produced by configuration loading, storage access
/// and conversation bookkeeping.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address could not be parsed
    #[error("Invalid JID '{jid}': {reason}")]
    InvalidJid {
        /// The offending address
        jid: String,
        /// Parser error text
        reason: String,
    },

    /// A conversation with this name is already registered
    #[error("Conversation {0} already exists")]
    DuplicateConversation(String),

    /// Capabilities hash did not match the advertised features
    #[error("Capabilities verification failed for {ver}")]
    CapsMismatch {
        /// Advertised verification string
        ver: String,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Create a new storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid JID error.
    pub fn invalid_jid(jid: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidJid {
            jid: jid.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Classification of a backend (legacy network) disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendErrorKind {
    /// Disconnected without an error
    #[default]
    None,
    /// Network or connection failure
    NetworkError,
    /// The legacy username was rejected
    InvalidUsername,
    /// Credentials were rejected
    AuthenticationFailed,
    /// The legacy server does not offer TLS
    NoSslSupport,
    /// TLS negotiation failed
    EncryptionError,
    /// Another client took over the legacy account
    NameInUse,
    /// Account settings are invalid
    InvalidSettings,
    /// Certificate missing or untrusted
    CertificateError,
    /// Unclassified connection error
    OtherError,
}

impl BackendErrorKind {
    /// Whether a disconnect of this class is retried automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError | Self::OtherError)
    }

    /// The value used in the error payload's `type` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NetworkError => "network-error",
            Self::InvalidUsername => "invalid-username",
            Self::AuthenticationFailed => "authentication-failed",
            Self::NoSslSupport => "no-ssl-support",
            Self::EncryptionError => "encryption-error",
            Self::NameInUse => "name-in-use",
            Self::InvalidSettings => "invalid-settings",
            Self::CertificateError => "certificate-error",
            Self::OtherError => "other-error",
        }
    }

    /// Build the `<error/>` payload carried by the terminal system message.
    pub fn to_element(&self) -> Element {
        Element::builder("error", NS_TRANSPORT_ERROR)
            .attr("type", self.as_str())
            .build()
    }
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
