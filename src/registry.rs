use crate::model::{normalize_description, NegotiatedProtocol, ProtocolStats};
use crate::{BridgeError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Canonical store of negotiated protocols.
///
/// Protocols are keyed by id, with a secondary index from normalized task
/// description to id. Share one registry between bridges by wrapping it in
/// an `Arc`; give each bridge its own for isolated caches.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_id: HashMap<String, NegotiatedProtocol>,
    by_description: HashMap<String, String>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, task_description: &str) -> Option<NegotiatedProtocol> {
        let key = normalize_description(task_description);
        let inner = self.inner.read();
        inner
            .by_description
            .get(&key)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn get(&self, id: &str) -> Option<NegotiatedProtocol> {
        self.inner.read().by_id.get(id).cloned()
    }

    /// Insert a protocol. Storing the same schema again under its id is a
    /// no-op; a different schema under an existing id is a conflict.
    pub fn store(&self, protocol: NegotiatedProtocol) -> Result<()> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.by_id.get(&protocol.id) {
            if existing.schema_definition != protocol.schema_definition {
                return Err(BridgeError::Conflict(format!(
                    "protocol {} already registered with a different schema",
                    protocol.id
                )));
            }
            return Ok(());
        }

        let key = normalize_description(&protocol.description);
        if let Some(owner) = inner.by_description.get(&key) {
            return Err(BridgeError::Conflict(format!(
                "task {:?} already bound to protocol {}",
                key, owner
            )));
        }

        tracing::info!("Registered protocol {} for task {:?}", protocol.id, key);
        inner.by_description.insert(key, protocol.id.clone());
        inner.by_id.insert(protocol.id.clone(), protocol);
        Ok(())
    }

    /// Fold one observation into the rolling averages of a protocol.
    ///
    /// Statistics are advisory: an unknown id is logged and ignored.
    pub fn record_usage(&self, id: &str, processing_time_ms: f64, compression_ratio: f64) {
        let mut inner = self.inner.write();
        let Some(protocol) = inner.by_id.get_mut(id) else {
            tracing::warn!("Ignoring usage statistics for unknown protocol {}", id);
            return;
        };

        let stats = protocol.stats.get_or_insert_with(ProtocolStats::default);
        let previous = stats.uses as f64;
        stats.uses += 1;
        let count = stats.uses as f64;
        stats.avg_processing_time = (stats.avg_processing_time * previous + processing_time_ms) / count;
        stats.compression_ratio = (stats.compression_ratio * previous + compression_ratio) / count;
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored protocol, ordered by id.
    pub fn protocols(&self) -> Vec<NegotiatedProtocol> {
        let mut protocols: Vec<_> = self.inner.read().by_id.values().cloned().collect();
        protocols.sort_by(|a, b| a.id.cmp(&b.id));
        protocols
    }
}
