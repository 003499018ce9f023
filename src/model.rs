use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    #[serde(rename = "read:public", alias = "read_public")]
    ReadPublic,
    #[serde(rename = "write:posts", alias = "write_posts")]
    WritePosts,
    #[serde(rename = "generate:feeds", alias = "generate_feeds")]
    GenerateFeeds,
    #[serde(rename = "moderate:content", alias = "moderate_content")]
    ModerateContent,
    #[serde(rename = "interact:users", alias = "interact_users")]
    InteractUsers,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::ReadPublic,
        Capability::WritePosts,
        Capability::GenerateFeeds,
        Capability::ModerateContent,
        Capability::InteractUsers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ReadPublic => "read:public",
            Capability::WritePosts => "write:posts",
            Capability::GenerateFeeds => "generate:feeds",
            Capability::ModerateContent => "moderate:content",
            Capability::InteractUsers => "interact:users",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = BridgeError;

    /// Accepts the wire form (`write:posts`) and the snake form (`write_posts`).
    fn from_str(s: &str) -> Result<Self> {
        let wire = s.trim().replacen('_', ":", 1);
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == wire)
            .ok_or_else(|| BridgeError::UnknownCapability(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub did: String,
    pub handle: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub endpoint: String,
    pub description: String,
    pub creator: Option<String>,
}

impl Agent {
    pub fn new(
        did: impl Into<String>,
        endpoint: impl Into<String>,
        description: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            did: did.into(),
            handle: None,
            capabilities: capabilities.into_iter().collect(),
            endpoint: endpoint.into(),
            description: description.into(),
            creator: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(BridgeError::MissingCapability {
                agent: self.did.clone(),
                capability: capability.to_string(),
            })
        }
    }
}

/// One capability granted to one agent on behalf of one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentPermission {
    pub user_did: String,
    pub agent_did: String,
    pub capability: Capability,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub limitations: Option<Map<String, Value>>,
}

impl AgentPermission {
    pub fn grant(
        user_did: impl Into<String>,
        agent_did: impl Into<String>,
        capability: Capability,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_did: user_did.into(),
            agent_did: agent_did.into(),
            capability,
            granted_at: Utc::now(),
            expires_at,
            limitations: None,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.granted_at && self.expires_at.map_or(true, |expiry| now < expiry)
    }

    pub fn permits(&self, agent_did: &str, capability: Capability, now: DateTime<Utc>) -> bool {
        self.agent_did == agent_did && self.capability == capability && self.is_active_at(now)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolSide {
    Agora,
    Atproto,
}

impl ProtocolSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolSide::Agora => "agora",
            ProtocolSide::Atproto => "atproto",
        }
    }
}

impl fmt::Display for ProtocolSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStats {
    pub compression_ratio: f64,
    pub avg_processing_time: f64,
    #[serde(default)]
    pub uses: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiatedProtocol {
    pub id: String,
    pub version: String,
    pub description: String,
    #[serde(rename = "schema", alias = "schemaDefinition")]
    pub schema_definition: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ProtocolStats>,
}

pub const DEFAULT_PROTOCOL_VERSION: &str = "1.0";

impl NegotiatedProtocol {
    /// Build a protocol whose id is derived from the normalized description.
    pub fn new(description: &str, version: Option<String>, schema_definition: Value) -> Self {
        Self {
            id: protocol_id(description),
            version: version.unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string()),
            description: description.trim().to_string(),
            schema_definition,
            stats: None,
        }
    }
}

/// Case- and whitespace-insensitive form of a task description.
pub fn normalize_description(description: &str) -> String {
    description
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stable protocol id: SHA-256 of the normalized description, hex encoded.
pub fn protocol_id(description: &str) -> String {
    let digest = Sha256::digest(normalize_description(description).as_bytes());
    hex::encode(digest)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeMessage {
    pub source: ProtocolSide,
    pub target: ProtocolSide,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<NegotiatedProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl BridgeMessage {
    pub fn new(source: ProtocolSide, target: ProtocolSide, content: Value) -> Result<Self> {
        if source == target {
            return Err(BridgeError::InvalidInput(format!(
                "bridge message source and target are both {source}"
            )));
        }
        Ok(Self {
            source,
            target,
            content,
            protocol: None,
            meta: None,
        })
    }

    pub fn with_protocol(mut self, protocol: Option<NegotiatedProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Value of the `type` field of object content, if any.
    pub fn message_type(&self) -> Option<&str> {
        self.content.get("type").and_then(Value::as_str)
    }
}

/// Wire envelope of the Agora agent endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgoraEnvelope {
    pub protocol_hash: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub target: ProtocolSide,
    pub protocol_id: Option<String>,
    pub response: Value,
    pub delivered_at: DateTime<Utc>,
}
