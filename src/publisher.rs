//! Lays generated identities out on disk for external hosting.
//!
//! ```text
//! <output>/public/<handle>/.well-known/did.json   safe to serve over HTTP
//! <output>/private/<label>_private_key.pem        never served
//! <output>/private/<label>_config.json            never served
//! ```

use crate::did::{self, DidDocumentBuilder, WELL_KNOWN_DID_PATH};
use crate::error::{BridgeError, Result};
use crate::keys::KeyPairFactory;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const PUBLIC_DIR: &str = "public";
pub const PRIVATE_DIR: &str = "private";
pub const DEPLOYMENT_GUIDE: &str = "deployment_guide.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedIdentity {
    pub did: String,
    pub handle: String,
    pub did_document: PathBuf,
    pub private_key: PathBuf,
    pub identity_record: PathBuf,
}

#[derive(Debug, Default)]
pub struct IdentityPublisher {
    factory: KeyPairFactory,
    builder: DidDocumentBuilder,
}

/// A file written next to its final location, renamed into place on commit.
struct PendingFile {
    temp: PathBuf,
    target: PathBuf,
}

impl IdentityPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and stage identities for every `(agent name, domain)` pair.
    ///
    /// Inputs are validated before anything touches the disk. Each agent is
    /// then staged all-or-nothing; the first failing agent aborts the run
    /// with its error and is never reported as staged.
    ///
    /// Existing files for the same agents are overwritten with fresh keys.
    pub fn stage(
        &self,
        agents: &[(String, String)],
        output_dir: &Path,
    ) -> Result<BTreeMap<String, StagedIdentity>> {
        let mut handles = HashSet::new();
        for (name, domain) in agents {
            let handle = did::handle_for(name, domain)?;
            if !handles.insert(handle.clone()) {
                return Err(BridgeError::InvalidInput(format!(
                    "agent {name} maps to duplicate handle {handle}"
                )));
            }
        }

        let mut staged = BTreeMap::new();
        for (name, domain) in agents {
            let identity = self.stage_agent(name, domain, output_dir).map_err(|e| {
                tracing::error!("Failed to stage identity for {}: {}", name, e);
                e
            })?;
            tracing::info!(
                "Staged identity {} (document: {})",
                identity.did,
                identity.did_document.display()
            );
            staged.insert(name.clone(), identity);
        }

        Ok(staged)
    }

    fn stage_agent(&self, name: &str, domain: &str, output_dir: &Path) -> Result<StagedIdentity> {
        let key_pair = self.factory.generate()?;
        let (document, record) = self.builder.build(name, domain, &key_pair)?;
        let label = did::agent_label(name)?;

        let public_dir = output_dir.join(PUBLIC_DIR).join(&record.handle);
        let private_dir = output_dir.join(PRIVATE_DIR);
        let did_document = public_dir.join(WELL_KNOWN_DID_PATH);
        let private_key = private_dir.join(format!("{label}_private_key.pem"));
        let identity_record = private_dir.join(format!("{label}_config.json"));

        if let Some(parent) = did_document.parent() {
            fs::create_dir_all(parent)?;
        }
        create_private_dir(&private_dir)?;

        let document_json = document.to_json_pretty()?;
        let record_json = serde_json::to_string_pretty(&record)?;
        // The public document goes last so it never points at a key that was not kept.
        let files: [(&Path, &[u8], bool); 3] = [
            (&private_key, record.private_key_pem.as_bytes(), true),
            (&identity_record, record_json.as_bytes(), true),
            (&did_document, document_json.as_bytes(), false),
        ];

        let mut pending = Vec::with_capacity(files.len());
        for (target, contents, private) in files {
            if let Err(e) = write_pending(target, contents, private, &mut pending) {
                discard(&pending);
                return Err(e);
            }
        }
        commit(&pending)?;

        Ok(StagedIdentity {
            did: record.did,
            handle: record.handle,
            did_document,
            private_key,
            identity_record,
        })
    }
}

fn write_pending(
    target: &Path,
    contents: &[u8],
    private: bool,
    pending: &mut Vec<PendingFile>,
) -> Result<()> {
    let temp = sibling(target, "tmp")?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    pending.push(PendingFile {
        temp: temp.clone(),
        target: target.to_path_buf(),
    });

    let mut file = options.open(&temp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

fn sibling(target: &Path, suffix: &str) -> Result<PathBuf> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BridgeError::Io(format!("invalid target path {}", target.display())))?;
    Ok(target.with_file_name(format!(".{file_name}.{}.{suffix}", uuid::Uuid::new_v4())))
}

/// Move every pending file into place. Files being replaced are kept aside
/// until the last rename succeeded and restored if any rename fails.
fn commit(pending: &[PendingFile]) -> Result<()> {
    let mut replaced: Vec<(PathBuf, &Path)> = Vec::new();

    for (index, file) in pending.iter().enumerate() {
        let outcome = set_aside(&file.target).and_then(|backup| {
            if let Some(backup) = backup {
                replaced.push((backup, file.target.as_path()));
            }
            fs::rename(&file.temp, &file.target).map_err(BridgeError::from)
        });

        if let Err(e) = outcome {
            for done in &pending[..index] {
                let _ = fs::remove_file(&done.target);
            }
            for (backup, target) in &replaced {
                if let Err(restore) = fs::rename(backup, target) {
                    tracing::error!("Failed to restore {}: {}", target.display(), restore);
                }
            }
            discard(&pending[index..]);
            return Err(e);
        }
    }

    for (backup, _) in replaced {
        let _ = fs::remove_file(backup);
    }
    Ok(())
}

fn set_aside(target: &Path) -> Result<Option<PathBuf>> {
    if !target.is_file() {
        return Ok(None);
    }
    let backup = sibling(target, "bak")?;
    fs::rename(target, &backup)?;
    Ok(Some(backup))
}

fn discard(pending: &[PendingFile]) {
    for file in pending {
        let _ = fs::remove_file(&file.temp);
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write a markdown guide describing where each staged document must be served.
pub fn write_deployment_guide(
    staged: &BTreeMap<String, StagedIdentity>,
    output_dir: &Path,
) -> Result<PathBuf> {
    let mut guide = String::from(
        "# Agent DID Deployment Guide\n\n\
         Each DID document below must be served over HTTPS at its URL.\n\
         Files under `private/` hold signing keys and must never be uploaded.\n",
    );

    for (name, identity) in staged {
        let relative = identity
            .did_document
            .strip_prefix(output_dir)
            .unwrap_or(&identity.did_document);
        guide.push_str(&format!(
            "\n## {name}\n\n* DID: `{}`\n* File: `{}`\n* URL: `https://{}/{}`\n",
            identity.did,
            relative.display(),
            identity.handle,
            WELL_KNOWN_DID_PATH
        ));
    }

    guide.push_str(
        "\n## Verify\n\n\
         Run `did-validator --config-dir <output>/private` once the documents are live.\n",
    );

    let path = output_dir.join(DEPLOYMENT_GUIDE);
    fs::write(&path, guide)?;
    Ok(path)
}
