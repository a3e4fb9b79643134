//! Resource descriptors and the cluster-wide resource directory.
//!
//! A descriptor is the cluster-visible record of one bound resource. It is
//! stored in the KV store under `r://<node>@<resource>/<instance_id>` as a
//! length-prefixed JSON record, and mirrored in memory by every instance.

mod directory;

pub use directory::ResourceDirectory;

use std::collections::BTreeMap;

use jid::FullJid;
use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::parser::element_to_string;
use crate::stanza::{full_jid, JidExt, Stanza};
use crate::XmppError;

/// KV prefix of resource descriptors.
pub const RESOURCE_KEY_PREFIX: &str = "r://";

/// Well-known info map keys.
pub mod info_keys {
    /// Message carbons enabled for the resource
    pub const CARBONS_ENABLED: &str = "carbons:enabled";
    /// The resource fetched its roster during this session
    pub const ROSTER_REQUESTED: &str = "roster:requested";
    /// The presence broadcast phase already ran for this bind
    pub const FIRST_AVAILABLE_DELIVERED: &str = "presence:first_available";
    /// The resource queried its archive during this session
    pub const ARCHIVE_REQUESTED: &str = "archive:requested";
}

/// String-keyed map of typed per-resource facts. Values are kept in their
/// string projection so the map crosses instance boundaries unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoMap(BTreeMap<String, String>);

impl InfoMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store any displayable value.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.0.insert(key.to_string(), value.to_string());
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Raw string value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Boolean value; absent or unparsable reads as `false`.
    pub fn bool(&self, key: &str) -> bool {
        self.get(key).map(|v| v == "true").unwrap_or(false)
    }

    /// Integer value.
    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Float value.
    pub fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Cluster-visible record of a bound resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDesc {
    instance_id: String,
    jid: FullJid,
    presence: Option<Stanza>,
    info: InfoMap,
}

#[derive(Serialize, Deserialize)]
struct EncodedDesc {
    instance_id: String,
    domain: String,
    info: InfoMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    presence: Option<String>,
}

impl ResourceDesc {
    /// Create a descriptor.
    pub fn new(
        instance_id: impl Into<String>,
        jid: FullJid,
        presence: Option<Stanza>,
        info: InfoMap,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            jid,
            presence,
            info,
        }
    }

    /// Owning instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Bound JID.
    pub fn jid(&self) -> &FullJid {
        &self.jid
    }

    /// Account node.
    pub fn username(&self) -> &str {
        self.jid.node().map(|n| n.as_str()).unwrap_or("")
    }

    /// Resource part.
    pub fn resource(&self) -> &str {
        self.jid.resource().as_str()
    }

    /// Last presence sent to self, if any.
    pub fn presence(&self) -> Option<&Stanza> {
        self.presence.as_ref()
    }

    /// Info map.
    pub fn info(&self) -> &InfoMap {
        &self.info
    }

    /// Presence priority, 0 without presence.
    pub fn priority(&self) -> i8 {
        self.presence.as_ref().map(|p| p.priority()).unwrap_or(0)
    }

    /// Last presence is available.
    pub fn is_available(&self) -> bool {
        self.presence
            .as_ref()
            .map(|p| p.is_available())
            .unwrap_or(false)
    }

    /// KV key of this descriptor.
    pub fn key(&self) -> String {
        resource_key(self.username(), self.resource(), &self.instance_id)
    }

    /// Serialize as a big-endian `u32` length followed by a JSON record.
    pub fn encode(&self) -> Result<Vec<u8>, XmppError> {
        let record = EncodedDesc {
            instance_id: self.instance_id.clone(),
            domain: self.jid.domain().to_string(),
            info: self.info.clone(),
            presence: self
                .presence
                .as_ref()
                .map(|p| element_to_string(p.element()))
                .transpose()?,
        };
        let body = serde_json::to_vec(&record)
            .map_err(|e| XmppError::internal(format!("descriptor encoding failed: {}", e)))?;
        let len = u32::try_from(body.len())
            .map_err(|_| XmppError::internal("descriptor too large"))?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a value read under `key`.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, XmppError> {
        let (username, resource, key_instance) = parse_resource_key(key)
            .ok_or_else(|| XmppError::internal(format!("malformed resource key {}", key)))?;
        if bytes.len() < 4 {
            return Err(XmppError::internal("descriptor record truncated"));
        }
        let (prefix, body) = bytes.split_at(4);
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if body.len() != len {
            return Err(XmppError::internal(format!(
                "descriptor length mismatch: header {} body {}",
                len,
                body.len()
            )));
        }
        let record: EncodedDesc = serde_json::from_slice(body)
            .map_err(|e| XmppError::internal(format!("descriptor decoding failed: {}", e)))?;
        if record.instance_id != key_instance {
            return Err(XmppError::internal(format!(
                "descriptor instance {} does not match key {}",
                record.instance_id, key
            )));
        }
        let presence = match record.presence {
            Some(raw) => {
                let element: Element = raw
                    .parse()
                    .map_err(|e| XmppError::xml_parse(format!("descriptor presence: {}", e)))?;
                Some(Stanza::from_element(element)?)
            }
            None => None,
        };
        Ok(Self {
            instance_id: record.instance_id,
            jid: full_jid(username, &record.domain, resource)?,
            presence,
            info: record.info,
        })
    }
}

/// KV key for `username/resource` on `instance_id`.
pub fn resource_key(username: &str, resource: &str, instance_id: &str) -> String {
    format!(
        "{}{}@{}/{}",
        RESOURCE_KEY_PREFIX, username, resource, instance_id
    )
}

/// Split a resource key into `(username, resource, instance_id)`.
pub fn parse_resource_key(key: &str) -> Option<(&str, &str, &str)> {
    let rest = key.strip_prefix(RESOURCE_KEY_PREFIX)?;
    let (user_resource, instance_id) = rest.rsplit_once('/')?;
    let (username, resource) = user_resource.split_once('@')?;
    if username.is_empty() || resource.is_empty() || instance_id.is_empty() {
        return None;
    }
    Some((username, resource, instance_id))
}

/// Bare-JID predicate shared by routing code.
pub(crate) fn same_user(desc: &ResourceDesc, jid: &jid::Jid) -> bool {
    desc.username() == jid.node_str() && desc.jid.domain().as_str() == jid.domain_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::PresenceType;

    fn desc() -> ResourceDesc {
        let mut info = InfoMap::new();
        info.set(info_keys::CARBONS_ENABLED, true);
        info.set("counter", 42);
        let presence = Stanza::presence(PresenceType::Available)
            .with_from("ortuman@localhost/yard".parse::<FullJid>().unwrap())
            .with_child(
                Element::builder("priority", crate::parser::ns::JABBER_CLIENT)
                    .append("5")
                    .build(),
            );
        ResourceDesc::new(
            "instance-1",
            "ortuman@localhost/yard".parse().unwrap(),
            Some(presence),
            info,
        )
    }

    #[test]
    fn test_info_map_typed_reads() {
        let mut info = InfoMap::new();
        info.set("flag", true);
        info.set("n", -3);
        info.set("f", 1.5);

        assert!(info.bool("flag"));
        assert!(!info.bool("missing"));
        assert_eq!(info.int("n"), Some(-3));
        assert_eq!(info.float("f"), Some(1.5));
        assert_eq!(info.get("flag"), Some("true"));
    }

    #[test]
    fn test_descriptor_encoding_is_lossless() {
        let original = desc();
        let bytes = original.encode().unwrap();
        let decoded = ResourceDesc::decode(&original.key(), &bytes).unwrap();

        assert_eq!(decoded, original);
        assert_eq!(decoded.priority(), 5);
        assert!(decoded.is_available());
        assert!(decoded.info().bool(info_keys::CARBONS_ENABLED));
    }

    #[test]
    fn test_descriptor_without_presence() {
        let original = ResourceDesc::new(
            "i2",
            "noelia@localhost/balcony".parse().unwrap(),
            None,
            InfoMap::new(),
        );
        let decoded = ResourceDesc::decode(&original.key(), &original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.priority(), 0);
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let original = desc();
        let mut bytes = original.encode().unwrap();
        bytes.pop();
        assert!(ResourceDesc::decode(&original.key(), &bytes).is_err());
    }

    #[test]
    fn test_key_format() {
        assert_eq!(desc().key(), "r://ortuman@yard/instance-1");
        assert_eq!(
            parse_resource_key("r://ortuman@yard/with/slash/i1"),
            Some(("ortuman", "yard/with/slash", "i1"))
        );
        assert_eq!(parse_resource_key("r://nobody/i1"), None);
        assert_eq!(parse_resource_key("x://a@b/c"), None);
    }
}
