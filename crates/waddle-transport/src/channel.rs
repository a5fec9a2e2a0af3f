//! Outbound stanza delivery toward the XMPP side.
//!
//! Sends are fire-and-forget: the transport core never waits on delivery.

use jid::{BareJid, Jid};
use tokio::sync::mpsc;
use tracing::warn;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

/// Sink for stanzas addressed to front-end clients.
pub trait StanzaChannel: Send + Sync {
    /// Send a presence stanza.
    fn send_presence(&self, presence: Presence);

    /// Send a message stanza.
    fn send_message(&self, message: Message);

    /// End every client session of `jid` (server mode only).
    fn finish_session(&self, _jid: &BareJid, _error: Option<&str>) {}
}

/// Contact-list presence replay, owned by the roster synchronisation layer.
pub trait RosterManager: Send + Sync {
    /// Send the current presence of every legacy contact to `to`.
    fn send_current_presences(&self, to: &Jid);

    /// Send unavailable presence for every online legacy contact to `to`.
    fn send_unavailable_presences(&self, to: &Jid);
}

/// A stanza (or session command) queued for the front end.
#[derive(Debug, Clone)]
pub enum OutboundStanza {
    /// Presence stanza
    Presence(Box<Presence>),
    /// Message stanza
    Message(Box<Message>),
    /// Server-mode session termination
    FinishSession {
        /// Bare JID whose sessions end
        jid: BareJid,
        /// Stream error text
        error: Option<String>,
    },
}

/// [`StanzaChannel`] backed by an unbounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelStanzaSink {
    sender: mpsc::UnboundedSender<OutboundStanza>,
}

impl ChannelStanzaSink {
    /// Create a sink and the receiver draining it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundStanza>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn push(&self, stanza: OutboundStanza) {
        if self.sender.send(stanza).is_err() {
            warn!("Outbound stanza channel closed, dropping stanza");
        }
    }
}

impl StanzaChannel for ChannelStanzaSink {
    fn send_presence(&self, presence: Presence) {
        self.push(OutboundStanza::Presence(Box::new(presence)));
    }

    fn send_message(&self, message: Message) {
        self.push(OutboundStanza::Message(Box::new(message)));
    }

    fn finish_session(&self, jid: &BareJid, error: Option<&str>) {
        self.push(OutboundStanza::FinishSession {
            jid: jid.clone(),
            error: error.map(str::to_string),
        });
    }
}
