//! Consistency checks for staged identities, locally and against the
//! documents actually served on the web.

use crate::did::{AgentIdentityRecord, DidDocument, DidDocumentBuilder, WebDid, WELL_KNOWN_DID_PATH};
use crate::publisher::PUBLIC_DIR;
use crate::{BridgeError, Result};
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_SUFFIX: &str = "_config.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub valid: bool,
    pub messages: Vec<String>,
}

impl CheckReport {
    fn pass(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.messages.push(message.into());
    }

    fn new() -> Self {
        Self {
            valid: true,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentReport {
    pub agent: String,
    pub local: CheckReport,
    pub remote: Option<CheckReport>,
}

impl AgentReport {
    pub fn is_valid(&self) -> bool {
        self.local.valid && self.remote.as_ref().map_or(true, |r| r.valid)
    }
}

pub struct IdentityValidator {
    config_dir: PathBuf,
    records: BTreeMap<String, AgentIdentityRecord>,
    client: Client,
    use_https: bool,
    mirror: Option<String>,
}

impl std::fmt::Debug for IdentityValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityValidator")
            .field("config_dir", &self.config_dir)
            .field("agents", &self.records.keys().collect::<Vec<_>>())
            .field("use_https", &self.use_https)
            .field("mirror", &self.mirror)
            .finish()
    }
}

impl IdentityValidator {
    /// Load every `<name>_config.json` record in `config_dir`.
    ///
    /// Unreadable records are logged and skipped.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let mut records = BTreeMap::new();

        for entry in fs::read_dir(&config_dir)? {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CONFIG_SUFFIX));
            if !is_record {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .map_err(BridgeError::from)
                .and_then(|raw| Ok(serde_json::from_str::<AgentIdentityRecord>(&raw)?));
            match parsed {
                Ok(record) => {
                    tracing::info!("Loaded identity record for {}", record.name);
                    records.insert(record.name.to_lowercase(), record);
                }
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config_dir,
            records,
            client,
            use_https: true,
            mirror: None,
        })
    }

    pub fn use_https(mut self, use_https: bool) -> Self {
        self.use_https = use_https;
        self
    }

    /// Fetch documents from `<base>/<handle>/.well-known/did.json` instead of
    /// each handle's own host, e.g. a staging server for the `public/` tree.
    pub fn mirror(mut self, base_url: impl Into<String>) -> Self {
        self.mirror = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn record(&self, agent: &str) -> Option<&AgentIdentityRecord> {
        self.records.get(&agent.to_lowercase())
    }

    pub fn validate_local(&self, agent: &str) -> CheckReport {
        let mut report = CheckReport::new();
        let Some(record) = self.record(agent) else {
            report.fail(format!("Agent '{agent}' not found in {}", self.config_dir.display()));
            return report;
        };

        match WebDid::parse(&record.did) {
            Ok(did) if did.host() == record.handle => report.pass("DID matches handle"),
            Ok(did) => report.fail(format!(
                "Handle mismatch: DID host is {} but handle is {}",
                did.host(),
                record.handle
            )),
            Err(e) => report.fail(e.to_string()),
        }

        let key_pair = match record.key_pair() {
            Ok(key_pair) => key_pair,
            Err(e) => {
                report.fail(format!("Private key unreadable: {e}"));
                return report;
            }
        };
        let (x, y) = key_pair.public_coordinates();
        if x == record.public_key.x && y == record.public_key.y {
            report.pass("Public key matches private key");
        } else {
            report.fail("Public key does not match private key");
        }

        let Some((_, domain)) = record.handle.split_once('.') else {
            report.fail(format!("Handle {} has no domain", record.handle));
            return report;
        };
        let expected = DidDocumentBuilder::new()
            .build_at(&record.name, domain, &key_pair, record.created)
            .and_then(|(document, _)| {
                document.validate()?;
                document.to_json_pretty()
            });
        let expected = match expected {
            Ok(expected) => expected,
            Err(e) => {
                report.fail(format!("Cannot derive DID document: {e}"));
                return report;
            }
        };

        let published = self.published_document_path(&record.handle);
        match fs::read_to_string(&published) {
            Ok(actual) if actual == expected => {
                report.pass("Staged DID document matches private key");
            }
            Ok(_) => report.fail(format!(
                "Staged DID document {} differs from the one derived from the private key",
                published.display()
            )),
            Err(_) => report.pass(format!(
                "No staged document at {}, skipped",
                published.display()
            )),
        }

        report
    }

    /// `<output>/public/<handle>/.well-known/did.json` for a record stored in `<output>/private`.
    fn published_document_path(&self, handle: &str) -> PathBuf {
        let root = self.config_dir.parent().unwrap_or(&self.config_dir);
        root.join(PUBLIC_DIR).join(handle).join(WELL_KNOWN_DID_PATH)
    }

    pub fn document_url(&self, record: &AgentIdentityRecord) -> Result<String> {
        let did = WebDid::parse(&record.did)?;
        Ok(match &self.mirror {
            Some(base) => format!("{base}/{}/{WELL_KNOWN_DID_PATH}", did.host()),
            None => did.document_url(self.use_https),
        })
    }

    pub async fn validate_remote(&self, agent: &str) -> CheckReport {
        let mut report = CheckReport::new();
        let Some(record) = self.record(agent) else {
            report.fail(format!("Agent '{agent}' not found in {}", self.config_dir.display()));
            return report;
        };

        let url = match self.document_url(record) {
            Ok(url) => url,
            Err(e) => {
                report.fail(e.to_string());
                return report;
            }
        };

        let document = match self.fetch_document(&url).await {
            Ok(document) => document,
            Err(e) => {
                report.fail(format!("Failed to fetch DID document from {url}: {e}"));
                return report;
            }
        };

        if document.id != record.did {
            report.fail(format!(
                "DID mismatch: document has {} but record has {}",
                document.id, record.did
            ));
        }
        if let Err(e) = document.validate() {
            report.fail(e.to_string());
        }

        let key_found = document.verification_method.iter().any(|method| {
            method.public_key_jwk.x == record.public_key.x
                && method.public_key_jwk.y == record.public_key.y
        });
        if key_found {
            report.pass(format!("Document at {url} carries the agent's public key"));
        } else {
            report.fail("Public key in the record does not match any key in the DID document");
        }

        report
    }

    async fn fetch_document(&self, url: &str) -> Result<DidDocument> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Delivery(format!("HTTP {}", response.status())));
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Check every loaded agent, remotely too unless `local_only`.
    pub async fn validate_all(&self, local_only: bool) -> Vec<AgentReport> {
        let mut reports = Vec::with_capacity(self.records.len());
        for agent in self.records.keys() {
            let local = self.validate_local(agent);
            let remote = if local_only {
                None
            } else {
                Some(self.validate_remote(agent).await)
            };
            reports.push(AgentReport {
                agent: agent.clone(),
                local,
                remote,
            });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{IdentityPublisher, PRIVATE_DIR};
    use tempfile::TempDir;

    fn staged(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let agents: Vec<_> = names
            .iter()
            .map(|n| (n.to_string(), "example.test".to_string()))
            .collect();
        IdentityPublisher::new().stage(&agents, dir.path()).unwrap();
        dir
    }

    #[test]
    fn test_freshly_staged_identities_are_valid() {
        let dir = staged(&["alice", "bob"]);
        let validator = IdentityValidator::load(dir.path().join(PRIVATE_DIR)).unwrap();

        assert_eq!(validator.agents().collect::<Vec<_>>(), vec!["alice", "bob"]);
        let report = validator.validate_local("alice");
        assert!(report.valid, "{:?}", report.messages);
        assert!(report
            .messages
            .iter()
            .any(|m| m.contains("Staged DID document matches")));
    }

    #[test]
    fn test_tampered_document_detected() {
        let dir = staged(&["carol"]);
        let document = dir
            .path()
            .join("public/carol.example.test/.well-known/did.json");
        let tampered = fs::read_to_string(&document).unwrap().replace("key-0", "key-1");
        fs::write(&document, tampered).unwrap();

        let validator = IdentityValidator::load(dir.path().join(PRIVATE_DIR)).unwrap();
        assert!(!validator.validate_local("carol").valid);
    }

    #[test]
    fn test_handle_mismatch_detected() {
        let dir = staged(&["dave"]);
        let path = dir.path().join("private/dave_config.json");
        let mut record: AgentIdentityRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        record.handle = "someone-else.example.test".to_string();
        fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        let validator = IdentityValidator::load(dir.path().join(PRIVATE_DIR)).unwrap();
        let report = validator.validate_local("dave");
        assert!(!report.valid);
        assert!(report.messages[0].contains("Handle mismatch"));
    }

    #[test]
    fn test_corrupt_records_are_skipped() {
        let dir = staged(&["erin"]);
        fs::write(dir.path().join("private/broken_config.json"), "{not json").unwrap();

        let validator = IdentityValidator::load(dir.path().join(PRIVATE_DIR)).unwrap();
        assert_eq!(validator.agents().collect::<Vec<_>>(), vec!["erin"]);
        assert!(!validator.validate_local("broken").valid);
    }

    #[test]
    fn test_document_url() {
        let dir = staged(&["frank"]);
        let validator = IdentityValidator::load(dir.path().join(PRIVATE_DIR)).unwrap();
        let record = validator.record("Frank").unwrap().clone();

        assert_eq!(
            validator.document_url(&record).unwrap(),
            "https://frank.example.test/.well-known/did.json"
        );
        let mirrored = validator.mirror("http://127.0.0.1:8080/");
        assert_eq!(
            mirrored.document_url(&record).unwrap(),
            "http://127.0.0.1:8080/frank.example.test/.well-known/did.json"
        );
    }
}
