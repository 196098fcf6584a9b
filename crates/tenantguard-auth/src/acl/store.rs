//! Versioned persistence for the rule list
//!
//! Writers follow load → modify → `commit(expected_version, ..)`. A commit
//! against a moved version fails with [`Error::Conflict`] and nothing is
//! written, so readers only ever see whole documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::AclDocument;
use crate::error::{Error, Result};

/// A rule list document at a specific version
#[derive(Debug, Clone)]
pub struct VersionedAcl {
    /// Version to pass back on commit
    pub version: u64,
    /// The document at that version
    pub document: Arc<AclDocument>,
}

/// Storage for the enforcement layer's rule list
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Current document and its version
    async fn load(&self) -> Result<VersionedAcl>;

    /// Replace the document if the stored version still equals `expected_version`
    ///
    /// Returns the new version.
    async fn commit(&self, expected_version: u64, document: AclDocument) -> Result<u64>;
}

/// In-memory rule store
pub struct MemoryRuleStore {
    current: RwLock<VersionedAcl>,
}

impl MemoryRuleStore {
    /// Store holding `document` at version 0
    pub fn new(document: AclDocument) -> Self {
        Self {
            current: RwLock::new(VersionedAcl {
                version: 0,
                document: Arc::new(document),
            }),
        }
    }

    /// Current document without going through the async interface
    pub fn document(&self) -> Arc<AclDocument> {
        self.current.read().document.clone()
    }

    /// Overwrite the document unconditionally, as an operator edit would
    pub fn replace(&self, document: AclDocument) -> u64 {
        let mut current = self.current.write();
        current.version += 1;
        current.document = Arc::new(document);
        current.version
    }
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new(AclDocument::default())
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load(&self) -> Result<VersionedAcl> {
        Ok(self.current.read().clone())
    }

    async fn commit(&self, expected_version: u64, document: AclDocument) -> Result<u64> {
        let mut current = self.current.write();
        if current.version != expected_version {
            return Err(Error::Conflict {
                expected: expected_version,
                found: current.version,
            });
        }
        current.version += 1;
        current.document = Arc::new(document);
        Ok(current.version)
    }
}

/// Rule store backed by a JSON file
///
/// The file is read once on open and again on [`reload`](Self::reload);
/// loads are served from memory. A commit re-reads the file first and
/// conflicts if it was edited since the last load, then writes a sibling
/// temp file and renames it over the original.
pub struct JsonFileRuleStore {
    path: PathBuf,
    current: RwLock<VersionedAcl>,
    commit_lock: tokio::sync::Mutex<()>,
}

impl JsonFileRuleStore {
    /// Open `path`; a missing file starts an empty document
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = read_document(&path)?;
        info!(path = %path.display(), rules = document.len(), "Opened rule file");

        Ok(Self {
            path,
            current: RwLock::new(VersionedAcl {
                version: 0,
                document: Arc::new(document),
            }),
            commit_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Pick up edits made to the file outside this process
    ///
    /// Bumps the version when the content changed, so in-flight writers conflict.
    pub async fn reload(&self) -> Result<bool> {
        let _guard = self.commit_lock.lock().await;
        let document = read_document(&self.path)?;

        let mut current = self.current.write();
        if *current.document == document {
            return Ok(false);
        }
        current.version += 1;
        current.document = Arc::new(document);
        debug!(version = current.version, "Rule file changed on disk");
        Ok(true)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleStore for JsonFileRuleStore {
    async fn load(&self) -> Result<VersionedAcl> {
        Ok(self.current.read().clone())
    }

    async fn commit(&self, expected_version: u64, document: AclDocument) -> Result<u64> {
        let _guard = self.commit_lock.lock().await;

        let on_disk = read_document(&self.path)?;
        {
            let mut current = self.current.write();
            if *current.document != on_disk {
                current.version += 1;
                current.document = Arc::new(on_disk);
                warn!(
                    version = current.version,
                    path = %self.path.display(),
                    "Rule file changed on disk since last load"
                );
                return Err(Error::Conflict {
                    expected: expected_version,
                    found: current.version,
                });
            }
            if current.version != expected_version {
                return Err(Error::Conflict {
                    expected: expected_version,
                    found: current.version,
                });
            }
        }

        let json = document.to_json()?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, json.as_bytes()))
            .await
            .map_err(|e| Error::Internal(format!("rule file writer panicked: {}", e)))??;

        let mut current = self.current.write();
        current.version += 1;
        current.document = Arc::new(document);
        debug!(version = current.version, path = %self.path.display(), "Committed rule file");
        Ok(current.version)
    }
}

fn read_document(path: &Path) -> Result<AclDocument> {
    match std::fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(AclDocument::default()),
        Ok(contents) => AclDocument::from_json(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AclDocument::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
