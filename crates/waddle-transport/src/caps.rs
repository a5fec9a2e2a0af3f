//! XEP-0115: Entity Capabilities
//!
//! Sessions hold back the backend connection until they know what the
//! connecting client supports. Clients advertise a verification hash in
//! their presence; the hash is resolved through a shared cache populated by
//! disco#info answers.
//!
//! ## Key Components
//!
//! - `Caps`: The `<c>` element included in presence stanzas
//! - `CapsCache`: Shared `ver -> disco#info` store plus the `address -> ver` index
//! - `CapabilityCache`: The read-only view sessions consult
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0115.html>

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashmap::DashMap;
use jid::Jid;
use sha1::{Digest, Sha1};
use tracing::debug;
use xmpp_parsers::minidom::Element;
use xmpp_parsers::presence::Presence;

use crate::TransportError;

/// XEP-0115 Entity Capabilities namespace.
pub const NS_CAPS: &str = "http://jabber.org/protocol/caps";

/// The only hash scheme the shared cache understands.
pub const SUPPORTED_HASH: &str = "sha-1";

/// Entity Capabilities element (`<c xmlns='http://jabber.org/protocol/caps'>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caps {
    /// Hash algorithm; absent for pre-1.5 (legacy) capabilities
    pub hash: Option<String>,
    /// Node identifying the client software
    pub node: String,
    /// Verification string
    pub ver: String,
}

impl Caps {
    /// Create a new Caps element with SHA-1 hash.
    pub fn new(node: &str, ver: &str) -> Self {
        Self {
            hash: Some(SUPPORTED_HASH.to_string()),
            node: node.to_string(),
            ver: ver.to_string(),
        }
    }

    /// Create a legacy Caps element (no hash attribute).
    pub fn legacy(node: &str, ver: &str) -> Self {
        Self {
            hash: None,
            node: node.to_string(),
            ver: ver.to_string(),
        }
    }

    /// Whether the shared cache can resolve this hash scheme.
    pub fn is_supported(&self) -> bool {
        self.hash.as_deref() == Some(SUPPORTED_HASH)
    }

    /// Build the `<c>` element for inclusion in presence stanzas.
    pub fn build_element(&self) -> Element {
        let mut builder = Element::builder("c", NS_CAPS)
            .attr("node", &self.node)
            .attr("ver", &self.ver);
        if let Some(ref hash) = self.hash {
            builder = builder.attr("hash", hash);
        }
        builder.build()
    }

    /// Parse a Caps element. `hash` is optional to accept legacy clients.
    pub fn from_element(elem: &Element) -> Option<Self> {
        if !elem.is("c", NS_CAPS) {
            return None;
        }

        let hash = elem.attr("hash").map(str::to_string);
        let node = elem.attr("node")?.to_string();
        let ver = elem.attr("ver")?.to_string();

        Some(Self { hash, node, ver })
    }
}

/// Extract Caps from a presence stanza.
pub fn extract_caps(presence: &Presence) -> Option<Caps> {
    presence.payloads.iter().find_map(Caps::from_element)
}

/// Identity element of a disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Category (e.g., "client", "gateway")
    pub category: String,
    /// Type (e.g., "pc", "phone")
    pub type_: String,
    /// Optional name (human-readable)
    pub name: Option<String>,
}

impl Identity {
    /// Create a new identity.
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            type_: type_.to_string(),
            name: name.map(|s| s.to_string()),
        }
    }
}

/// Feature element of a disco#info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature(pub String);

impl Feature {
    /// Create a new feature.
    pub fn new(var: &str) -> Self {
        Self(var.to_string())
    }
}

/// Resolved disco#info for a capabilities hash.
#[derive(Debug, Clone, Default)]
pub struct CachedDiscoInfo {
    /// Identities from disco#info
    pub identities: Vec<Identity>,
    /// Features from disco#info
    pub features: Vec<Feature>,
}

impl CachedDiscoInfo {
    /// Create a new cached disco#info entry.
    pub fn new(identities: Vec<Identity>, features: Vec<Feature>) -> Self {
        Self {
            identities,
            features,
        }
    }

    /// Check whether a feature is advertised.
    pub fn has_feature(&self, var: &str) -> bool {
        self.features.iter().any(|f| f.0 == var)
    }
}

/// Read-only capability lookups used by user sessions.
pub trait CapabilityCache: Send + Sync {
    /// Features advertised by `address`, if known.
    fn caps_for(&self, address: &Jid) -> Option<CachedDiscoInfo>;

    /// Whether the features of `address` are known.
    fn has_caps(&self, address: &Jid) -> bool {
        self.caps_for(address).is_some()
    }

    /// Note the capabilities `address` advertised in its presence.
    fn note_advertised(&self, _address: &Jid, _caps: &Caps) {}

    /// Offer a disco#info answer of `address` to the cache.
    ///
    /// Returns `true` when the cache now resolves `address`.
    fn learn(&self, _address: &Jid, _info: &CachedDiscoInfo) -> bool {
        false
    }
}

/// Shared cache for entity capabilities.
///
/// Maps verification hashes to disco#info responses, and addresses to the
/// hash they last advertised.
#[derive(Debug, Clone, Default)]
pub struct CapsCache {
    /// Map from verification hash to disco#info data
    cache: Arc<DashMap<String, CachedDiscoInfo>>,
    /// Map from entity address to its advertised verification hash
    entities: Arc<DashMap<Jid, String>>,
}

impl CapsCache {
    /// Create a new empty capabilities cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the hash an entity advertised in its presence.
    ///
    /// Legacy (unsupported) hashes are not indexed.
    pub fn record_presence(&self, address: &Jid, caps: &Caps) {
        if caps.is_supported() {
            self.entities.insert(address.clone(), caps.ver.clone());
        }
    }

    /// Store disco#info for a capabilities hash.
    pub fn insert(&self, ver: &str, info: CachedDiscoInfo) {
        debug!(ver = %ver, identities = info.identities.len(), features = info.features.len(), "Caching caps");
        self.cache.insert(ver.to_string(), info);
    }

    /// Store disco#info after checking it hashes to the verification string `ver`.
    pub fn insert_verified(&self, ver: &str, info: CachedDiscoInfo) -> Result<(), TransportError> {
        if compute_caps_hash(&info.identities, &info.features) != ver {
            return Err(TransportError::CapsMismatch {
                ver: ver.to_string(),
            });
        }
        self.insert(ver, info);
        Ok(())
    }

    /// Retrieve cached disco#info for a capabilities hash.
    pub fn get(&self, ver: &str) -> Option<CachedDiscoInfo> {
        self.cache.get(ver).map(|entry| entry.value().clone())
    }
}

impl CapabilityCache for CapsCache {
    fn caps_for(&self, address: &Jid) -> Option<CachedDiscoInfo> {
        let ver = self.entities.get(address)?.value().clone();
        self.get(&ver)
    }

    fn note_advertised(&self, address: &Jid, caps: &Caps) {
        self.record_presence(address, caps);
    }

    fn learn(&self, address: &Jid, info: &CachedDiscoInfo) -> bool {
        let Some(ver) = self.entities.get(address).map(|entry| entry.value().clone()) else {
            return false;
        };
        match self.insert_verified(&ver, info.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(address = %address, error = %e, "Not caching disco#info");
                false
            }
        }
    }
}

/// Compute the capabilities verification string per XEP-0115 Section 5.
pub fn compute_caps_hash(identities: &[Identity], features: &[Feature]) -> String {
    let verification_string = build_verification_string(identities, features);
    hash_verification_string(&verification_string)
}

/// Build the verification string: sorted `category/type/lang/name<`
/// identities followed by sorted `feature<` entries.
fn build_verification_string(identities: &[Identity], features: &[Feature]) -> String {
    let mut s = String::new();

    let mut sorted_identities: Vec<_> = identities.iter().collect();
    sorted_identities.sort_by(|a, b| (&a.category, &a.type_, &a.name).cmp(&(&b.category, &b.type_, &b.name)));

    for id in sorted_identities {
        s.push_str(&id.category);
        s.push('/');
        s.push_str(&id.type_);
        s.push('/'); // lang
        s.push('/');
        if let Some(ref name) = id.name {
            s.push_str(name);
        }
        s.push('<');
    }

    let mut sorted_features: Vec<_> = features.iter().map(|f| &f.0).collect();
    sorted_features.sort();

    for feat in sorted_features {
        s.push_str(feat);
        s.push('<');
    }

    s
}

fn hash_verification_string(verification_string: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(verification_string.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::presence::Type as PresenceType;

    fn client_info() -> CachedDiscoInfo {
        CachedDiscoInfo::new(
            vec![Identity::new("client", "pc", Some("Psi"))],
            vec![
                Feature::new("http://jabber.org/protocol/muc"),
                Feature::new(NS_CAPS),
            ],
        )
    }

    #[test]
    fn test_caps_from_element() {
        let elem = Element::builder("c", NS_CAPS)
            .attr("hash", "sha-1")
            .attr("node", "https://psi-im.org")
            .attr("ver", "xyz789")
            .build();

        let caps = Caps::from_element(&elem).unwrap();
        assert!(caps.is_supported());
        assert_eq!(caps.node, "https://psi-im.org");
        assert_eq!(caps.ver, "xyz789");
    }

    #[test]
    fn test_caps_from_element_legacy() {
        let elem = Caps::legacy("http://gajim.org", "0.12").build_element();
        let caps = Caps::from_element(&elem).unwrap();
        assert_eq!(caps.hash, None);
        assert!(!caps.is_supported());
    }

    #[test]
    fn test_caps_other_hash_is_unsupported() {
        let mut caps = Caps::new("node", "ver");
        caps.hash = Some("md5".to_string());
        assert!(!caps.is_supported());
    }

    #[test]
    fn test_caps_from_element_wrong_ns() {
        let elem = Element::builder("c", "wrong:ns")
            .attr("hash", "sha-1")
            .attr("node", "https://test.com")
            .attr("ver", "xyz789")
            .build();

        assert!(Caps::from_element(&elem).is_none());
    }

    #[test]
    fn test_extract_caps() {
        let mut presence = Presence::new(PresenceType::None);
        assert!(extract_caps(&presence).is_none());

        presence.payloads.push(Caps::new("https://test.com", "abc123").build_element());
        let caps = extract_caps(&presence).unwrap();
        assert_eq!(caps.ver, "abc123");
    }

    #[test]
    fn test_cache_resolves_by_address() {
        let cache = CapsCache::new();
        let address: Jid = "alice@example.com/psi".parse().unwrap();
        let caps = Caps::new("https://psi-im.org", "ver1");

        cache.record_presence(&address, &caps);
        assert!(!cache.has_caps(&address));

        cache.insert("ver1", client_info());
        assert!(cache.has_caps(&address));
        assert!(cache
            .caps_for(&address)
            .unwrap()
            .has_feature("http://jabber.org/protocol/muc"));

    }

    #[test]
    fn test_cache_ignores_legacy_hash() {
        let cache = CapsCache::new();
        let address: Jid = "alice@example.com/gajim".parse().unwrap();
        cache.insert("0.12", client_info());
        cache.record_presence(&address, &Caps::legacy("http://gajim.org", "0.12"));
        assert!(!cache.has_caps(&address));
    }

    #[test]
    fn test_insert_verified() {
        let cache = CapsCache::new();
        let info = client_info();
        let ver = compute_caps_hash(&info.identities, &info.features);

        cache.insert_verified(&ver, info.clone()).unwrap();
        assert!(cache.get(&ver).is_some());

        let result = cache.insert_verified("bogus", info);
        assert!(matches!(result, Err(TransportError::CapsMismatch { .. })));
        assert!(cache.get("bogus").is_none());
    }

    #[test]
    fn test_learn_verifies_advertised_hash() {
        let cache = CapsCache::new();
        let info = client_info();
        let ver = compute_caps_hash(&info.identities, &info.features);
        let psi: Jid = "alice@example.com/psi".parse().unwrap();
        let other: Jid = "alice@example.com/other".parse().unwrap();

        // Nothing advertised yet
        assert!(!cache.learn(&psi, &info));

        cache.note_advertised(&psi, &Caps::new("https://psi-im.org", &ver));
        assert!(cache.learn(&psi, &info));
        assert!(cache.has_caps(&psi));

        cache.note_advertised(&other, &Caps::new("https://other.org", "forged"));
        assert!(!cache.learn(&other, &info));
        assert!(!cache.has_caps(&other));
    }

    #[test]
    fn test_build_verification_string_full() {
        let identities = vec![
            Identity::new("gateway", "icq", Some("Test")),
            Identity::new("client", "pc", Some("MyClient")),
        ];
        let features = vec![Feature::new("feature2"), Feature::new("feature1")];
        let s = build_verification_string(&identities, &features);
        assert_eq!(s, "client/pc//MyClient<gateway/icq//Test<feature1<feature2<");
    }

    #[test]
    fn test_compute_caps_hash_known_value() {
        // SHA1("") = da39a3ee5e6b4b0d3255bfef95601890afd80709
        assert_eq!(hash_verification_string(""), "2jmj7l5rSw0yVb/vlWAYkK/YBwk=");
    }
}
