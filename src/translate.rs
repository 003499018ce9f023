//! Reshaping of message content according to a negotiated protocol.
//!
//! A protocol schema may carry a `mappings` object keyed by target side:
//!
//! ```json
//! {
//!   "mappings": {
//!     "atproto": { "type": {"const": "post"}, "text": "/summary" },
//!     "agora":   { "summary": "/text" }
//!   }
//! }
//! ```
//!
//! Each output field is either a JSON pointer into the source content (a bare
//! key is read as a top-level field) or a constant. Fields whose pointer does
//! not resolve are omitted. Without a protocol, or without a mapping for the
//! target, content passes through unchanged and is marked as natural language.

use crate::model::{BridgeMessage, NegotiatedProtocol, ProtocolSide};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const FORMAT_STRUCTURED: &str = "structured";
pub const FORMAT_NATURAL_LANGUAGE: &str = "natural_language";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldRule {
    Pointer(String),
    Const {
        #[serde(rename = "const")]
        value: Value,
    },
}

impl FieldRule {
    fn resolve(&self, content: &Value) -> Option<Value> {
        match self {
            FieldRule::Const { value } => Some(value.clone()),
            FieldRule::Pointer(pointer) if pointer.starts_with('/') || pointer.is_empty() => {
                content.pointer(pointer).cloned()
            }
            FieldRule::Pointer(key) => content.get(key).cloned(),
        }
    }
}

pub type FieldMapping = BTreeMap<String, FieldRule>;

/// Mapping the protocol defines for messages headed to `target`, if any.
///
/// A malformed mapping is treated as absent.
pub fn mapping_for(protocol: &NegotiatedProtocol, target: ProtocolSide) -> Option<FieldMapping> {
    let raw = protocol
        .schema_definition
        .get("mappings")?
        .get(target.as_str())?;

    match serde_json::from_value(raw.clone()) {
        Ok(mapping) => Some(mapping),
        Err(e) => {
            tracing::warn!(
                "Ignoring malformed {} mapping of protocol {}: {}",
                target,
                protocol.id,
                e
            );
            None
        }
    }
}

/// Build the target representation of `content` from a field mapping.
///
/// A `type` tag on the source is carried over unless the mapping sets one.
pub fn apply_mapping(content: &Value, mapping: &FieldMapping) -> Value {
    let mut out = Map::new();
    for (field, rule) in mapping {
        if let Some(value) = rule.resolve(content) {
            out.insert(field.clone(), value);
        }
    }
    if !out.contains_key("type") {
        if let Some(tag) = content.get("type") {
            out.insert("type".to_string(), tag.clone());
        }
    }
    Value::Object(out)
}

/// Translate a message into its target representation. Never fails.
pub fn translate(mut message: BridgeMessage) -> BridgeMessage {
    let mut meta = message.meta.take().unwrap_or_default();

    let mapping = message
        .protocol
        .as_ref()
        .and_then(|protocol| mapping_for(protocol, message.target));

    if let Some(protocol) = &message.protocol {
        meta.insert("protocolHash".to_string(), Value::String(protocol.id.clone()));
    }

    match mapping {
        Some(mapping) => {
            let original_size = message.content.to_string().len();
            message.content = apply_mapping(&message.content, &mapping);
            meta.insert("originalSize".to_string(), original_size.into());
            meta.insert("format".to_string(), FORMAT_STRUCTURED.into());
            meta.insert("translated".to_string(), Value::Bool(true));
        }
        None => {
            meta.insert("format".to_string(), FORMAT_NATURAL_LANGUAGE.into());
            meta.insert("translated".to_string(), Value::Bool(false));
        }
    }

    message.meta = Some(meta);
    message
}

/// Serialized size of a translated message relative to its source content.
///
/// Untranslated messages report 1.0.
pub fn compression_ratio(message: &BridgeMessage) -> f64 {
    let original = message
        .meta
        .as_ref()
        .and_then(|meta| meta.get("originalSize"))
        .and_then(Value::as_u64);
    match original {
        Some(before) if before > 0 => message.content.to_string().len() as f64 / before as f64,
        _ => 1.0,
    }
}
