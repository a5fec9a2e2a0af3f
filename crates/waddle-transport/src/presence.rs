//! Presence aggregation and presence helpers.
//!
//! The transport reads presence state through [`PresenceOracle`]: every
//! resource's last presence for a bare identity, and the single
//! highest-priority one that is mirrored to the backend.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use jid::{BareJid, Jid};
use tracing::debug;
use uuid::Uuid;
use xmpp_parsers::presence::{Presence, Show, Type as PresenceType};

use crate::TransportError;

/// Multi-User Chat namespace (XEP-0045).
pub const NS_MUC: &str = "http://jabber.org/protocol/muc";

/// Status text sent to resources while the backend connection is pending.
pub const CONNECTING_STATUS: &str = "Connecting";

/// Presence aggregation for bare identities.
pub trait PresenceOracle: Send + Sync {
    /// Last known presence of every resource of `jid`.
    fn all_presences(&self, jid: &BareJid) -> Vec<Presence>;

    /// The presence that represents `jid` as a whole.
    ///
    /// Highest priority among available resources; when no resource is
    /// available, the last unavailable presence if any.
    fn highest_priority_presence(&self, jid: &BareJid) -> Option<Presence> {
        highest_priority(&self.all_presences(jid))
    }
}

/// In-memory presence store keyed by bare identity.
#[derive(Debug, Default)]
pub struct MemoryPresenceOracle {
    presences: RwLock<HashMap<BareJid, Vec<Presence>>>,
}

impl MemoryPresenceOracle {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence, replacing the previous one from the same resource.
    ///
    /// Presences without a `from` address are ignored, as are presences
    /// directed at a room or peer: those say nothing about the resource's
    /// own availability.
    pub fn record(&self, presence: &Presence) {
        let Some(from) = presence.from.as_ref() else {
            return;
        };
        if !is_bare_directed(presence) {
            debug!(from = %from, to = ?presence.to, "Not recording directed presence");
            return;
        }
        let mut presences = self.presences.write().unwrap_or_else(PoisonError::into_inner);
        let entries = presences.entry(from.to_bare()).or_default();
        entries.retain(|p| p.from.as_ref() != Some(from));
        entries.push(presence.clone());
        debug!(from = %from, resources = entries.len(), "Recorded presence");
    }

    /// Forget every presence of `jid`.
    pub fn clear(&self, jid: &BareJid) {
        self.presences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(jid);
    }
}

impl PresenceOracle for MemoryPresenceOracle {
    fn all_presences(&self, jid: &BareJid) -> Vec<Presence> {
        self.presences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(jid)
            .cloned()
            .unwrap_or_default()
    }
}

/// Pick the presence representing a set of resource presences.
pub fn highest_priority(presences: &[Presence]) -> Option<Presence> {
    let mut best: Option<&Presence> = None;
    for presence in presences.iter().filter(|p| !is_unavailable(p)) {
        let better = match best {
            None => true,
            Some(current) => {
                (presence.priority, show_rank(presence)) >= (current.priority, show_rank(current))
            }
        };
        if better {
            best = Some(presence);
        }
    }

    best.or_else(|| presences.iter().rev().find(|p| is_unavailable(p)))
        .cloned()
}

/// Ordering of availability states when priorities tie.
fn show_rank(presence: &Presence) -> u8 {
    match presence.show {
        Some(Show::Chat) => 5,
        None => 4,
        Some(Show::Away) => 3,
        Some(Show::Xa) => 2,
        Some(Show::Dnd) => 1,
    }
}

/// Check if a presence is of type unavailable.
pub fn is_unavailable(presence: &Presence) -> bool {
    presence.type_ == PresenceType::Unavailable
}

/// Check if a presence is addressed to the gateway itself rather than to a
/// room or peer behind it.
pub fn is_bare_directed(presence: &Presence) -> bool {
    presence
        .to
        .as_ref()
        .map_or(true, |to| to.node().is_none())
}

/// Check if a presence addressed to `to` is a group-chat presence.
///
/// Either it carries a MUC `<x/>` element, or the room name uses the
/// IRC-style `#` prefix.
pub fn is_room_presence(presence: &Presence, to: &Jid) -> bool {
    presence.payloads.iter().any(|payload| payload.is("x", NS_MUC))
        || to
            .node()
            .map(|node| node.to_string().starts_with('#'))
            .unwrap_or(false)
}

/// Extract the room password from a MUC join presence.
pub fn muc_password(presence: &Presence) -> Option<String> {
    presence.payloads.iter().find_map(|payload| {
        if payload.is("x", NS_MUC) {
            payload.get_child("password", NS_MUC).map(|p| p.text())
        } else {
            None
        }
    })
}

/// Map a gateway address (`node@transport/resource`) to the legacy-side name.
///
/// The node is unescaped per XEP-0106 for the characters legacy networks
/// commonly use (`@`, space).
pub fn legacy_name(jid: &Jid) -> Option<String> {
    jid.node()
        .map(|node| node.to_string().replace("\\40", "@").replace("\\20", " "))
}

/// Map a legacy-side name onto the gateway (`name@transport`).
///
/// Inverse of [`legacy_name`].
pub fn gateway_address(name: &str, gateway: &BareJid) -> Result<BareJid, TransportError> {
    let node = name.replace(' ', "\\20").replace('@', "\\40");
    let address = format!("{node}@{gateway}");
    address
        .parse()
        .map_err(|e| TransportError::invalid_jid(address.as_str(), e))
}

/// Resource part of an address, if any.
pub fn resource_of(jid: &Jid) -> Option<String> {
    jid.resource().map(|r| r.to_string())
}

/// Build a presence of the given type between two addresses.
pub fn build_presence(type_: PresenceType, from: Jid, to: Jid) -> Presence {
    let mut presence = Presence::new(type_);
    presence.from = Some(from);
    presence.to = Some(to);
    presence
}

/// Build an unavailable presence with an optional status text.
pub fn build_unavailable(from: Jid, to: Jid, status: Option<&str>) -> Presence {
    let mut presence = build_presence(PresenceType::Unavailable, from, to);
    if let Some(text) = status {
        presence.statuses.insert(String::new(), text.to_string());
    }
    presence
}

/// Build a presence probe.
pub fn build_probe(from: &BareJid, to: &BareJid) -> Presence {
    let mut presence = build_presence(
        PresenceType::Probe,
        Jid::from(from.clone()),
        Jid::from(to.clone()),
    );
    presence.id = Some(Uuid::new_v4().to_string());
    presence
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::minidom::Element;

    fn presence_from(from: &str, priority: i8, show: Option<Show>) -> Presence {
        let mut presence = Presence::new(PresenceType::None);
        presence.from = Some(from.parse().unwrap());
        presence.priority = priority;
        presence.show = show;
        presence
    }

    fn unavailable_from(from: &str) -> Presence {
        let mut presence = Presence::new(PresenceType::Unavailable);
        presence.from = Some(from.parse().unwrap());
        presence
    }

    #[test]
    fn test_highest_priority_prefers_priority() {
        let presences = vec![
            presence_from("a@x/phone", 1, None),
            presence_from("a@x/desktop", 5, Some(Show::Away)),
        ];
        let highest = highest_priority(&presences).unwrap();
        assert_eq!(highest.from.unwrap().to_string(), "a@x/desktop");
    }

    #[test]
    fn test_highest_priority_tie_uses_show() {
        let presences = vec![
            presence_from("a@x/phone", 0, Some(Show::Dnd)),
            presence_from("a@x/desktop", 0, Some(Show::Chat)),
        ];
        let highest = highest_priority(&presences).unwrap();
        assert_eq!(highest.from.unwrap().to_string(), "a@x/desktop");
    }

    #[test]
    fn test_highest_priority_all_unavailable() {
        let presences = vec![unavailable_from("a@x/phone")];
        let highest = highest_priority(&presences).unwrap();
        assert!(is_unavailable(&highest));
        assert!(highest_priority(&[]).is_none());
    }

    #[test]
    fn test_memory_oracle_replaces_per_resource() {
        let oracle = MemoryPresenceOracle::new();
        let bare: BareJid = "a@x".parse().unwrap();

        oracle.record(&presence_from("a@x/phone", 0, None));
        oracle.record(&presence_from("a@x/desktop", 0, None));
        oracle.record(&unavailable_from("a@x/phone"));

        let all = oracle.all_presences(&bare);
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|p| !is_unavailable(p)).count(), 1);
        assert_eq!(
            oracle
                .highest_priority_presence(&bare)
                .unwrap()
                .from
                .unwrap()
                .to_string(),
            "a@x/desktop"
        );

        oracle.clear(&bare);
        assert!(oracle.all_presences(&bare).is_empty());
    }

    #[test]
    fn test_memory_oracle_ignores_room_presence() {
        let oracle = MemoryPresenceOracle::new();
        let bare: BareJid = "a@x".parse().unwrap();

        let mut online = presence_from("a@x/laptop", 0, None);
        online.to = Some("transport.x".parse().unwrap());
        oracle.record(&online);

        let mut leave = unavailable_from("a@x/laptop");
        leave.to = Some("room1@transport.x/alice".parse().unwrap());
        oracle.record(&leave);

        let all = oracle.all_presences(&bare);
        assert_eq!(all.len(), 1);
        assert!(!is_unavailable(&all[0]));
        assert!(!is_bare_directed(&leave));
        assert!(is_bare_directed(&online));
    }

    #[test]
    fn test_room_presence_detection() {
        let to: Jid = "room1@transport.x/nick".parse().unwrap();
        let mut presence = Presence::new(PresenceType::None);
        assert!(!is_room_presence(&presence, &to));

        presence.payloads.push(Element::builder("x", NS_MUC).build());
        assert!(is_room_presence(&presence, &to));

        let irc: Jid = "#rust@irc.x/nick".parse().unwrap();
        assert!(is_room_presence(&Presence::new(PresenceType::None), &irc));
    }

    #[test]
    fn test_muc_password() {
        let mut presence = Presence::new(PresenceType::None);
        assert_eq!(muc_password(&presence), None);

        let x = Element::builder("x", NS_MUC)
            .append(Element::builder("password", NS_MUC).append("secret").build())
            .build();
        presence.payloads.push(x);
        assert_eq!(muc_password(&presence), Some("secret".to_string()));
    }

    #[test]
    fn test_legacy_name() {
        let jid: Jid = "john\\40icq.com@transport.x/res".parse().unwrap();
        assert_eq!(legacy_name(&jid), Some("john@icq.com".to_string()));

        let domain: Jid = "transport.x".parse().unwrap();
        assert_eq!(legacy_name(&domain), None);
    }

    #[test]
    fn test_gateway_address_round_trips_legacy_name() {
        let gateway: BareJid = "transport.x".parse().unwrap();
        let address = gateway_address("john@icq.com", &gateway).unwrap();
        assert_eq!(address.to_string(), "john\\40icq.com@transport.x");
        assert_eq!(
            legacy_name(&Jid::from(address)),
            Some("john@icq.com".to_string())
        );
    }

    #[test]
    fn test_build_unavailable_with_status() {
        let presence = build_unavailable(
            "transport.x".parse().unwrap(),
            "a@x/phone".parse().unwrap(),
            Some(CONNECTING_STATUS),
        );
        assert!(is_unavailable(&presence));
        assert_eq!(presence.statuses.get(""), Some(&CONNECTING_STATUS.to_string()));
    }

    #[test]
    fn test_build_probe() {
        let probe = build_probe(&"transport.x".parse().unwrap(), &"a@x".parse().unwrap());
        assert_eq!(probe.type_, PresenceType::Probe);
        assert_eq!(probe.to.unwrap().to_string(), "a@x");
        assert!(probe.id.is_some());
    }
}
