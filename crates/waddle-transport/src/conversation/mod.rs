//! Conversations bridged between a user and the legacy network.
//!
//! A conversation is either a group room or a one-to-one exchange with a
//! legacy peer. Group conversations track which of the user's resources
//! joined them; a group conversation with no joined resource is torn down by
//! the owning session unless the user keeps a sticky session.

pub mod manager;

pub use manager::ConversationManager;

use std::collections::{BTreeMap, VecDeque};

use jid::{BareJid, Jid};
use tracing::warn;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::{Presence, Show, Type as PresenceType};

/// A legacy-side room participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Occupant {
    /// Nickname in the room
    pub nick: String,
    /// Availability, `None` for plain available
    pub show: Option<Show>,
    /// Status text
    pub status: Option<String>,
}

impl Occupant {
    /// Create an available occupant.
    pub fn new(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            show: None,
            status: None,
        }
    }
}

/// One room or one-to-one exchange.
#[derive(Debug)]
pub struct Conversation {
    /// Legacy-side room or peer name
    name: String,
    /// Address of the room or peer on the gateway
    jid: BareJid,
    is_group: bool,
    /// Nickname used on the legacy side (group conversations)
    nickname: Option<String>,
    /// Front-end resources currently joined
    participants: Vec<Jid>,
    /// Legacy-side participants (nick -> Occupant)
    occupants: BTreeMap<String, Occupant>,
    /// Recent room messages replayed to joining resources
    history: VecDeque<Message>,
    history_limit: usize,
    /// Messages held back while the session caches delivery
    cached: Vec<Message>,
    /// Resource that last wrote in a one-to-one exchange
    active_resource: Option<Jid>,
}

impl Conversation {
    /// Create a new conversation.
    pub fn new(name: impl Into<String>, jid: BareJid, is_group: bool, history_limit: usize) -> Self {
        Self {
            name: name.into(),
            jid,
            is_group,
            nickname: None,
            participants: Vec::new(),
            occupants: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit,
            cached: Vec::new(),
            active_resource: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    pub fn is_group(&self) -> bool {
        self.is_group
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = Some(nickname.into());
    }

    /// Front-end resources joined to this conversation.
    pub fn participants(&self) -> &[Jid] {
        &self.participants
    }

    pub fn has_participant(&self, jid: &Jid) -> bool {
        self.participants.contains(jid)
    }

    /// Add a joined resource. Returns `false` if it was already present.
    pub fn add_participant(&mut self, jid: Jid) -> bool {
        if self.has_participant(&jid) {
            return false;
        }
        self.participants.push(jid);
        true
    }

    /// Remove a joined resource. Returns `true` if it was present.
    pub fn remove_participant(&mut self, jid: &Jid) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != jid);
        self.participants.len() != before
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Forget all joined resources without tearing the conversation down.
    pub fn clear_participants(&mut self) {
        self.participants.clear();
    }

    /// Insert or update a legacy-side participant.
    pub fn set_occupant(&mut self, occupant: Occupant) {
        self.occupants.insert(occupant.nick.clone(), occupant);
    }

    /// Remove a legacy-side participant.
    pub fn remove_occupant(&mut self, nick: &str) -> Option<Occupant> {
        self.occupants.remove(nick)
    }

    pub fn occupants(&self) -> impl Iterator<Item = &Occupant> {
        self.occupants.values()
    }

    /// Presence of every legacy-side participant, addressed to `to`.
    pub fn participant_presences(&self, to: &Jid) -> Vec<Presence> {
        self.occupants
            .values()
            .filter_map(|occupant| {
                let from = match format!("{}/{}", self.jid, occupant.nick).parse::<Jid>() {
                    Ok(from) => from,
                    Err(e) => {
                        warn!(room = %self.jid, nick = %occupant.nick, error = %e, "Skipping occupant with invalid nickname");
                        return None;
                    }
                };
                let mut presence = Presence::new(PresenceType::None);
                presence.from = Some(from);
                presence.to = Some(to.clone());
                presence.show = occupant.show.clone();
                if let Some(ref status) = occupant.status {
                    presence.statuses.insert(String::new(), status.clone());
                }
                Some(presence)
            })
            .collect()
    }

    /// Remember a room message for replay, dropping the oldest past the limit.
    pub fn push_history(&mut self, message: Message) {
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }

    /// Cached room history, addressed to `to`.
    pub fn history_for(&self, to: &Jid) -> Vec<Message> {
        self.history
            .iter()
            .map(|message| address_message(message, to))
            .collect()
    }

    /// Hold a message back until delivery resumes.
    pub fn cache_message(&mut self, message: Message) {
        self.cached.push(message);
    }

    pub fn cached_count(&self) -> usize {
        self.cached.len()
    }

    /// Drain held-back messages.
    pub fn take_cached(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.cached)
    }

    /// Record which resource last wrote in a one-to-one exchange.
    pub fn set_active_resource(&mut self, resource: Jid) {
        self.active_resource = Some(resource);
    }

    pub fn active_resource(&self) -> Option<&Jid> {
        self.active_resource.as_ref()
    }

    /// Drop per-resource routing so delivery targets are recomputed.
    pub fn reset_resources(&mut self) {
        self.active_resource = None;
    }

    /// Where a message from the legacy side should be delivered.
    ///
    /// Group: every joined resource. One-to-one: the active resource, else
    /// the bare identity so the server routes it.
    pub fn delivery_targets(&self, owner: &BareJid) -> Vec<Jid> {
        if self.is_group {
            self.participants.clone()
        } else {
            vec![self
                .active_resource
                .clone()
                .unwrap_or_else(|| Jid::from(owner.clone()))]
        }
    }
}

/// Copy of `message` addressed to `to`.
pub(crate) fn address_message(message: &Message, to: &Jid) -> Message {
    let mut addressed = message.clone();
    addressed.to = Some(to.clone());
    addressed
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::message::{Body, MessageType};

    fn room() -> Conversation {
        Conversation::new("room1", "room1@transport.x".parse().unwrap(), true, 2)
    }

    fn groupchat(body: &str) -> Message {
        let mut msg = Message::new(None::<Jid>);
        msg.type_ = MessageType::Groupchat;
        msg.bodies.insert(String::new(), Body(body.to_string()));
        msg
    }

    #[test]
    fn test_participants_are_a_set() {
        let mut conv = room();
        let jid: Jid = "b@x/laptop".parse().unwrap();

        assert!(conv.add_participant(jid.clone()));
        assert!(!conv.add_participant(jid.clone()));
        assert_eq!(conv.participant_count(), 1);

        assert!(conv.remove_participant(&jid));
        assert!(!conv.remove_participant(&jid));
        assert_eq!(conv.participant_count(), 0);
    }

    #[test]
    fn test_occupant_update_replaces_by_nick() {
        let mut conv = room();
        conv.set_occupant(Occupant::new("alice"));
        let away = Occupant {
            nick: "alice".to_string(),
            show: Some(Show::Away),
            status: None,
        };
        conv.set_occupant(away.clone());

        assert_eq!(conv.occupants().collect::<Vec<_>>(), vec![&away]);
        assert_eq!(conv.remove_occupant("alice"), Some(away));
        assert_eq!(conv.occupants().count(), 0);
    }

    #[test]
    fn test_participant_presences() {
        let mut conv = room();
        conv.set_occupant(Occupant::new("alice"));
        conv.set_occupant(Occupant {
            nick: "bob".to_string(),
            show: Some(Show::Away),
            status: Some("lunch".to_string()),
        });

        let to: Jid = "b@x/laptop".parse().unwrap();
        let presences = conv.participant_presences(&to);
        assert_eq!(presences.len(), 2);
        assert_eq!(
            presences[0].from.as_ref().unwrap().to_string(),
            "room1@transport.x/alice"
        );
        assert_eq!(presences[1].show, Some(Show::Away));
        assert!(presences.iter().all(|p| p.to.as_ref() == Some(&to)));

        conv.remove_occupant("alice");
        assert_eq!(conv.participant_presences(&to).len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut conv = room();
        conv.push_history(groupchat("one"));
        conv.push_history(groupchat("two"));
        conv.push_history(groupchat("three"));

        let to: Jid = "b@x/laptop".parse().unwrap();
        let history = conv.history_for(&to);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].bodies.get("").unwrap().0, "two");
        assert_eq!(history[1].to.as_ref(), Some(&to));
    }

    #[test]
    fn test_one_to_one_delivery_targets() {
        let owner: BareJid = "b@x".parse().unwrap();
        let mut conv = Conversation::new("peer", "peer@transport.x".parse().unwrap(), false, 0);

        assert_eq!(conv.delivery_targets(&owner), vec![Jid::from(owner.clone())]);

        let resource: Jid = "b@x/phone".parse().unwrap();
        conv.set_active_resource(resource.clone());
        assert_eq!(conv.delivery_targets(&owner), vec![resource]);

        conv.reset_resources();
        assert_eq!(conv.delivery_targets(&owner), vec![Jid::from(owner)]);
    }

    #[test]
    fn test_cached_messages_drain() {
        let mut conv = room();
        conv.cache_message(groupchat("held"));
        assert_eq!(conv.cached_count(), 1);
        assert_eq!(conv.take_cached().len(), 1);
        assert_eq!(conv.cached_count(), 0);
    }
}
