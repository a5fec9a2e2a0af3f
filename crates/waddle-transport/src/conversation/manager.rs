//! Per-user conversation registry.

use std::collections::HashMap;

use jid::{BareJid, Jid};
use tracing::{debug, instrument};

use super::Conversation;
use crate::TransportError;

/// Registry of the conversations one user has open on the legacy network.
///
/// Owned by exactly one session; conversations are keyed by legacy name.
#[derive(Debug)]
pub struct ConversationManager {
    /// Bare JID of the owning user
    owner: BareJid,
    conversations: HashMap<String, Conversation>,
}

impl ConversationManager {
    /// Create an empty registry for `owner`.
    pub fn new(owner: BareJid) -> Self {
        Self {
            owner,
            conversations: HashMap::new(),
        }
    }

    pub fn owner(&self) -> &BareJid {
        &self.owner
    }

    /// Register a conversation.
    ///
    /// Returns an error if a conversation with the same name already exists.
    #[instrument(skip(self, conversation), fields(user = %self.owner, name = %conversation.name()))]
    pub fn add(&mut self, conversation: Conversation) -> Result<(), TransportError> {
        let name = conversation.name().to_string();
        if self.conversations.contains_key(&name) {
            return Err(TransportError::DuplicateConversation(name));
        }
        self.conversations.insert(name, conversation);
        debug!("Added conversation");
        Ok(())
    }

    /// Remove a conversation by name.
    #[instrument(skip(self), fields(user = %self.owner))]
    pub fn remove(&mut self, name: &str) -> Option<Conversation> {
        let removed = self.conversations.remove(name);
        if removed.is_some() {
            debug!("Removed conversation");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&Conversation> {
        self.conversations.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Conversation> {
        self.conversations.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.conversations.contains_key(name)
    }

    /// Find a conversation by its gateway address.
    pub fn find_by_jid(&self, jid: &BareJid) -> Option<&Conversation> {
        self.conversations.values().find(|c| c.jid() == jid)
    }

    /// Remove `resource` from every conversation.
    ///
    /// Returns the names of group conversations that are left without any
    /// joined resource, sorted for a stable teardown order.
    pub fn remove_participant(&mut self, resource: &Jid) -> Vec<String> {
        let mut emptied: Vec<String> = self
            .conversations
            .values_mut()
            .filter_map(|conversation| {
                let removed = conversation.remove_participant(resource);
                (removed && conversation.is_group() && conversation.participant_count() == 0)
                    .then(|| conversation.name().to_string())
            })
            .collect();
        emptied.sort();
        emptied
    }

    /// Drop per-resource routing in every conversation.
    pub fn reset_resources(&mut self) {
        for conversation in self.conversations.values_mut() {
            conversation.reset_resources();
        }
    }

    /// Forget joined resources everywhere while keeping the conversations.
    pub fn clear_participants(&mut self) {
        for conversation in self.conversations.values_mut() {
            conversation.clear_participants();
        }
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Names of every conversation, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.conversations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Conversation> {
        self.conversations.values_mut()
    }
}
