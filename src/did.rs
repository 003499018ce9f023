//! `did:web` documents and identity records.
//!
//! A document is a pure function of the agent name, the hosting domain and
//! the public key. Field order is fixed by the struct definitions, so the
//! serialized document is byte-stable across regenerations with one key.

use crate::error::{BridgeError, Result};
use crate::keys::{self, KeyPair};
use chrono::{DateTime, Utc};
use p256::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DID_CONTEXT: &str = "https://www.w3.org/ns/did/v1";
pub const VERIFICATION_METHOD_TYPE: &str = "JsonWebKey2020";
pub const WELL_KNOWN_DID_PATH: &str = ".well-known/did.json";

const DID_WEB_PREFIX: &str = "did:web:";
const KEY_FRAGMENT: &str = "key-0";
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "verificationMethod")]
    pub verification_method: Vec<VerificationMethod>,
    pub authentication: Vec<String>,
    #[serde(rename = "assertionMethod")]
    pub assertion_method: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    pub controller: String,
    #[serde(rename = "publicKeyJwk")]
    pub public_key_jwk: PublicKeyJwk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyCoordinates {
    pub x: String,
    pub y: String,
}

/// Private identity artifact. Never published alongside the DID document.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentIdentityRecord {
    pub name: String,
    pub did: String,
    pub handle: String,
    #[serde(rename = "privateKey")]
    pub private_key_pem: String,
    #[serde(rename = "publicKey")]
    pub public_key: PublicKeyCoordinates,
    pub created: DateTime<Utc>,
}

impl fmt::Debug for AgentIdentityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentIdentityRecord")
            .field("name", &self.name)
            .field("did", &self.did)
            .field("handle", &self.handle)
            .field("private_key_pem", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .field("created", &self.created)
            .finish()
    }
}

impl AgentIdentityRecord {
    /// Re-derive the key pair from the stored private key.
    pub fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pkcs8_pem(&self.private_key_pem)
    }
}

/// A parsed `did:web:<host>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WebDid {
    host: String,
}

impl WebDid {
    pub fn parse(did: &str) -> Result<Self> {
        let host = did
            .strip_prefix(DID_WEB_PREFIX)
            .ok_or_else(|| BridgeError::InvalidDid(format!("expected did:web:<host>, got {did}")))?;

        let host = validate_hostname(host)
            .map_err(|_| BridgeError::InvalidDid(format!("invalid host in {did}")))?;
        Ok(Self { host })
    }

    pub fn from_handle(handle: &str) -> Result<Self> {
        Ok(Self {
            host: validate_hostname(handle)?,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Reference to the single verification key of this DID.
    pub fn key_ref(&self) -> String {
        format!("{self}#{KEY_FRAGMENT}")
    }

    /// HTTPS location of the DID document for this identifier.
    pub fn document_url(&self, use_https: bool) -> String {
        let scheme = if use_https { "https" } else { "http" };
        format!("{scheme}://{}/{WELL_KNOWN_DID_PATH}", self.host)
    }
}

impl fmt::Display for WebDid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DID_WEB_PREFIX}{}", self.host)
    }
}

impl DidDocument {
    /// Serialize with two-space indentation.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Recover the public key from the single verification method.
    pub fn public_key(&self) -> Result<PublicKey> {
        let method = self.verification_method.first().ok_or_else(|| {
            BridgeError::InvalidDid(format!("{} has no verification method", self.id))
        })?;
        keys::public_key_from_coordinates(&method.public_key_jwk.x, &method.public_key_jwk.y)
    }

    /// Check the structural invariants of a single-key `did:web` document.
    pub fn validate(&self) -> Result<()> {
        let did = WebDid::parse(&self.id)?;
        let key_ref = did.key_ref();

        if self.verification_method.len() != 1 {
            return Err(BridgeError::InvalidDid(format!(
                "expected exactly one verification method, found {}",
                self.verification_method.len()
            )));
        }

        let method = &self.verification_method[0];
        if method.id != key_ref || method.controller != self.id {
            return Err(BridgeError::InvalidDid(format!(
                "verification method {} does not belong to {}",
                method.id, self.id
            )));
        }
        if method.method_type != VERIFICATION_METHOD_TYPE
            || method.public_key_jwk.kty != "EC"
            || method.public_key_jwk.crv != "P-256"
        {
            return Err(BridgeError::InvalidDid(
                "verification method must be a P-256 JsonWebKey2020".to_string(),
            ));
        }
        if self.authentication != [key_ref.clone()] || self.assertion_method != [key_ref] {
            return Err(BridgeError::InvalidDid(
                "authentication and assertionMethod must reference the single key".to_string(),
            ));
        }

        self.public_key().map(|_| ())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DidDocumentBuilder;

impl DidDocumentBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        agent_name: &str,
        domain: &str,
        key_pair: &KeyPair,
    ) -> Result<(DidDocument, AgentIdentityRecord)> {
        self.build_at(agent_name, domain, key_pair, Utc::now())
    }

    /// Like [`build`](Self::build) with an explicit creation timestamp.
    pub fn build_at(
        &self,
        agent_name: &str,
        domain: &str,
        key_pair: &KeyPair,
        created: DateTime<Utc>,
    ) -> Result<(DidDocument, AgentIdentityRecord)> {
        let handle = handle_for(agent_name, domain)?;
        let did = WebDid::from_handle(&handle)?;
        let did_string = did.to_string();
        let key_ref = did.key_ref();
        let (x, y) = key_pair.public_coordinates();

        let document = DidDocument {
            context: vec![DID_CONTEXT.to_string()],
            id: did_string.clone(),
            verification_method: vec![VerificationMethod {
                id: key_ref.clone(),
                method_type: VERIFICATION_METHOD_TYPE.to_string(),
                controller: did_string.clone(),
                public_key_jwk: PublicKeyJwk {
                    kty: "EC".to_string(),
                    crv: "P-256".to_string(),
                    x: x.clone(),
                    y: y.clone(),
                },
            }],
            authentication: vec![key_ref.clone()],
            assertion_method: vec![key_ref],
        };

        let record = AgentIdentityRecord {
            name: agent_name.to_string(),
            did: did_string,
            handle,
            private_key_pem: key_pair.to_pkcs8_pem()?,
            public_key: PublicKeyCoordinates { x, y },
            created,
        };

        Ok((document, record))
    }
}

/// `<agent label>.<domain>`, both lowercased and validated.
pub fn handle_for(agent_name: &str, domain: &str) -> Result<String> {
    let label = agent_label(agent_name)?;
    let domain = validate_hostname(domain)?;
    let handle = format!("{label}.{domain}");

    if handle.len() > MAX_HOSTNAME_LEN {
        return Err(BridgeError::InvalidDomain(format!(
            "{handle} exceeds {MAX_HOSTNAME_LEN} characters"
        )));
    }
    Ok(handle)
}

/// DNS label used as the agent's subdomain.
pub fn agent_label(agent_name: &str) -> Result<String> {
    let label = agent_name.trim().to_ascii_lowercase();
    if label.is_empty() {
        return Err(BridgeError::InvalidInput("agent name must not be empty".to_string()));
    }
    if !is_valid_label(&label) {
        return Err(BridgeError::InvalidInput(format!(
            "agent name {agent_name:?} is not usable as a DNS label"
        )));
    }
    Ok(label)
}

/// Validate a hostname and return its lowercase form.
pub fn validate_hostname(domain: &str) -> Result<String> {
    let domain = domain.trim().to_ascii_lowercase();

    if domain.is_empty() || domain.len() > MAX_HOSTNAME_LEN {
        return Err(BridgeError::InvalidDomain(format!("{domain:?}")));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || !labels.iter().all(|label| is_valid_label(label)) {
        return Err(BridgeError::InvalidDomain(format!("{domain:?}")));
    }

    Ok(domain)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPairFactory;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_build_shape() {
        let key = KeyPairFactory::new().generate().unwrap();
        let (doc, record) = DidDocumentBuilder::new()
            .build("alice", "example.test", &key)
            .unwrap();

        assert_eq!(doc.id, "did:web:alice.example.test");
        assert_eq!(doc.verification_method.len(), 1);
        assert_eq!(doc.verification_method[0].id, "did:web:alice.example.test#key-0");
        assert_eq!(doc.verification_method[0].controller, doc.id);
        assert_eq!(doc.authentication, vec!["did:web:alice.example.test#key-0"]);
        assert_eq!(doc.assertion_method, doc.authentication);
        assert_eq!(record.handle, "alice.example.test");
        assert_eq!(record.did, doc.id);
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_build_is_pure() {
        let key = KeyPairFactory::new().generate().unwrap();
        let builder = DidDocumentBuilder::new();
        let (a, ra) = builder.build_at("bob", "example.test", &key, fixed_time()).unwrap();
        let (b, rb) = builder.build_at("bob", "example.test", &key, fixed_time()).unwrap();

        assert_eq!(a.to_json_pretty().unwrap(), b.to_json_pretty().unwrap());
        assert_eq!(
            serde_json::to_string(&ra).unwrap(),
            serde_json::to_string(&rb).unwrap()
        );
    }

    #[test]
    fn test_regeneration_from_stored_key_is_byte_identical() {
        let key = KeyPairFactory::new().generate().unwrap();
        let builder = DidDocumentBuilder::new();
        let (doc, record) = builder.build("carol", "example.test", &key).unwrap();

        let restored = record.key_pair().unwrap();
        let (again, _) = builder.build("carol", "example.test", &restored).unwrap();
        assert_eq!(doc.to_json_pretty().unwrap(), again.to_json_pretty().unwrap());
    }

    #[test]
    fn test_jwk_recovers_public_key() {
        let key = KeyPairFactory::new().generate().unwrap();
        let (doc, _) = DidDocumentBuilder::new()
            .build("dave", "example.test", &key)
            .unwrap();
        assert_eq!(doc.public_key().unwrap(), key.public_key());
    }

    #[test]
    fn test_serialized_field_names() {
        let key = KeyPairFactory::new().generate().unwrap();
        let (doc, record) = DidDocumentBuilder::new()
            .build_at("erin", "example.test", &key, fixed_time())
            .unwrap();

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["@context"][0], DID_CONTEXT);
        assert_eq!(json["verificationMethod"][0]["type"], "JsonWebKey2020");
        assert_eq!(json["verificationMethod"][0]["publicKeyJwk"]["crv"], "P-256");

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["privateKey"].as_str().unwrap().contains("PRIVATE KEY"));
        assert_eq!(json["created"], "2024-05-01T12:00:00Z");
        assert!(json["publicKey"]["x"].is_string());
    }

    #[test]
    fn test_name_is_lowercased_for_handle() {
        let key = KeyPairFactory::new().generate().unwrap();
        let (doc, record) = DidDocumentBuilder::new()
            .build("Alice", "Example.Test", &key)
            .unwrap();
        assert_eq!(doc.id, "did:web:alice.example.test");
        assert_eq!(record.name, "Alice");
    }

    #[test]
    fn test_rejects_malformed_domain() {
        let key = KeyPairFactory::new().generate().unwrap();
        let builder = DidDocumentBuilder::new();

        for domain in ["", "localhost", "bad_domain.test", "-lead.test", "a..b", "spa ce.test"] {
            let err = builder.build("alice", domain, &key).unwrap_err();
            assert!(matches!(err, BridgeError::InvalidDomain(_)), "{domain}");
        }
    }

    #[test]
    fn test_rejects_empty_agent_name() {
        let key = KeyPairFactory::new().generate().unwrap();
        let err = DidDocumentBuilder::new()
            .build("  ", "example.test", &key)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput(_)));
    }

    #[test]
    fn test_web_did_parse_and_display() {
        let did = WebDid::parse("did:web:alice.example.test").unwrap();
        assert_eq!(did.host(), "alice.example.test");
        assert_eq!(did.to_string(), "did:web:alice.example.test");
        assert_eq!(
            did.document_url(true),
            "https://alice.example.test/.well-known/did.json"
        );

        assert!(WebDid::parse("did:plc:abc123").is_err());
        assert!(WebDid::parse("did:web:").is_err());
    }

    #[test]
    fn test_validate_detects_tampered_reference() {
        let key = KeyPairFactory::new().generate().unwrap();
        let (mut doc, _) = DidDocumentBuilder::new()
            .build("frank", "example.test", &key)
            .unwrap();
        doc.authentication = vec!["did:web:mallory.example.test#key-0".to_string()];
        assert!(matches!(doc.validate(), Err(BridgeError::InvalidDid(_))));
    }

    #[test]
    fn test_record_debug_redacts_private_key() {
        let key = KeyPairFactory::new().generate().unwrap();
        let (_, record) = DidDocumentBuilder::new()
            .build("grace", "example.test", &key)
            .unwrap();
        let debug = format!("{:?}", record);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("PRIVATE KEY"));
    }
}
