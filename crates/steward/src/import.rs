// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Registering files that appeared on a node.
//!
//! Discovery hands each new file to an [`Importer`]. The acquisition name
//! selects a [`MetadataExtractor`] by its type tag; files still being written
//! carry a `.<name>.lock` sibling and are left for a later pass.

use crate::checksum::md5sum_file;
use crate::config::RetryConfig;
use crate::retry::with_retry;
use crate::{Result, StewardError};
use catalog::{AcqName, ArchiveFile, HasFile, StorageNode, Store, WantsFile, upsert_copy};
use diagnostics::{log_debug, log_info, log_warn};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Extracted metadata, keyed by keyword.
pub type KeywordMap = BTreeMap<String, serde_json::Value>;

/// Reads instrument-specific metadata from a data file.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<KeywordMap>;
}

/// Extractors by acquisition type tag.
#[derive(Default, Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn MetadataExtractor>>,
}

impl ExtractorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `extractor` for `type_tag`, replacing any earlier one.
    pub fn register(&mut self, type_tag: impl Into<String>, extractor: Arc<dyn MetadataExtractor>) {
        let _ = self.extractors.insert(type_tag.into(), extractor);
    }

    #[must_use]
    pub fn get(&self, type_tag: &str) -> Option<&Arc<dyn MetadataExtractor>> {
        self.extractors.get(type_tag)
    }

    #[must_use]
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.extractors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("type_tags", &self.type_tags())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    /// A lock file says the file is still being written.
    Locked,
    /// The directory name is not an acquisition name.
    NotAcquisition,
    /// The node already holds a verified copy.
    AlreadyRegistered,
    Registered {
        file: ArchiveFile,
        keywords: KeywordMap,
        /// The size or hash disagreed with an existing catalog entry, so
        /// the copy was recorded as maybe-corrupt.
        suspect: bool,
    },
}

pub struct Importer {
    store: Arc<dyn Store>,
    registry: ExtractorRegistry,
    retry: RetryConfig,
}

impl Importer {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, registry: ExtractorRegistry, retry: RetryConfig) -> Self {
        Self {
            store,
            registry,
            retry,
        }
    }

    /// Register `<node root>/<acq_name>/<file_name>` in the catalog.
    pub async fn import_file(
        &self,
        node: &StorageNode,
        acq_name: &str,
        file_name: &str,
    ) -> Result<ImportOutcome> {
        let shortname = format!("{acq_name}/{file_name}");
        let lock = node.acq_dir(acq_name).join(format!(".{file_name}.lock"));
        if tokio::fs::try_exists(&lock).await? {
            log_info!(
                "Skipping {shortname}: locked",
                shortname: shortname.as_str()
            );
            return Ok(ImportOutcome::Locked);
        }

        let Some(parsed) = AcqName::parse(acq_name) else {
            log_debug!(
                "Not importing {shortname}: not an acquisition",
                shortname: shortname.as_str()
            );
            return Ok(ImportOutcome::NotAcquisition);
        };

        if let Some(acq) = self.store.find_acquisition(acq_name).await? {
            if let Some(file) = self.store.find_file(acq.id, file_name).await? {
                let copy = self.store.copy(file.id, node.id).await?;
                if copy.is_some_and(|c| c.has_file == HasFile::Yes) {
                    log_debug!(
                        "{shortname} is already registered on {node}",
                        node: node.name.as_str(),
                        shortname: shortname.as_str()
                    );
                    return Ok(ImportOutcome::AlreadyRegistered);
                }
            }
        }

        let path = node.copy_path(acq_name, file_name);
        let size_b = tokio::fs::metadata(&path).await?.len();
        let md5sum = md5sum_file(&path).await?;

        let keywords = match self.registry.get(&parsed.type_tag) {
            Some(extractor) => extractor.extract(&path)?,
            None => {
                log_debug!(
                    "No metadata extractor for type {type_tag}",
                    type_tag: parsed.type_tag.as_str()
                );
                KeywordMap::new()
            }
        };

        let store = self.store.as_ref();
        let acq = with_retry(&self.retry, "import", || async move {
            store.ensure_acquisition(acq_name).await
        })
        .await?;
        let md5_ref = md5sum.as_str();
        let file = with_retry(&self.retry, "import", || async move {
            store.ensure_file(acq.id, file_name, size_b, md5_ref).await
        })
        .await?;

        let suspect = file.size_b != size_b || file.md5sum != md5sum;
        if suspect {
            log_warn!(
                "{shortname} on {node} differs from the catalog (size {size_b}, md5 {md5sum})",
                node: node.name.as_str(),
                shortname: shortname.as_str(),
                size_b: size_b,
                md5sum: md5sum.as_str()
            );
        }
        let has = if suspect {
            HasFile::MaybeCorrupt
        } else {
            HasFile::Yes
        };

        let (file_id, node_id) = (file.id, node.id);
        let _ = with_retry(&self.retry, "import", || async move {
            let mut tx = store.begin().await?;
            let copy = upsert_copy(tx.as_mut(), file_id, node_id, has, WantsFile::Yes).await?;
            tx.commit().await?;
            Ok(copy)
        })
        .await?;

        log_info!(
            "Registered {shortname} on {node}",
            node: node.name.as_str(),
            shortname: shortname.as_str()
        );
        Ok(ImportOutcome::Registered {
            file,
            keywords,
            suspect,
        })
    }

    /// Import by node name, for the command line.
    pub async fn import_named(
        &self,
        node_name: &str,
        acq_name: &str,
        file_name: &str,
    ) -> Result<ImportOutcome> {
        let node = self
            .store
            .find_node(node_name)
            .await?
            .ok_or_else(|| StewardError::not_found("node", node_name))?;
        self.import_file(&node, acq_name, file_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::{MemoryStore, NewNode, StorageKind};
    use serde_json::json;
    use std::path::PathBuf;

    struct FixedExtractor;

    impl MetadataExtractor for FixedExtractor {
        fn extract(&self, path: &Path) -> Result<KeywordMap> {
            let mut keywords = KeywordMap::new();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let _ = keywords.insert("name".to_string(), json!(name));
            let _ = keywords.insert("freq_channels".to_string(), json!(1024));
            Ok(keywords)
        }
    }

    const ACQ: &str = "20170101T000000Z_chime_corr";

    async fn setup(root: PathBuf) -> (Arc<MemoryStore>, StorageNode) {
        let store = Arc::new(MemoryStore::new());
        let group = store.create_group("online").await.expect("group");
        let node = store
            .create_node(NewNode::new("disk1", group.id, "host1", root, StorageKind::Regular))
            .await
            .expect("node");
        (store, node)
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            delay_ms: 0,
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn test_import_registers_file_and_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, node) = setup(dir.path().to_path_buf()).await;
        std::fs::create_dir_all(dir.path().join(ACQ)).expect("mkdir");
        std::fs::write(dir.path().join(ACQ).join("00000000_0000.h5"), b"hello world\n")
            .expect("write");

        let mut registry = ExtractorRegistry::new();
        registry.register("corr", Arc::new(FixedExtractor));
        let importer = Importer::new(store.clone(), registry, fast_retry());

        let outcome = importer
            .import_file(&node, ACQ, "00000000_0000.h5")
            .await
            .expect("import");
        let ImportOutcome::Registered {
            file,
            keywords,
            suspect,
        } = outcome
        else {
            panic!("expected registration, got {outcome:?}");
        };
        assert!(!suspect);
        assert_eq!(file.size_b, 12);
        assert_eq!(file.md5sum, "6f5902ac237024bdd0c176cb93063dc4");
        assert_eq!(keywords.get("freq_channels"), Some(&json!(1024)));

        let copy = store.copy(file.id, node.id).await.expect("copy").expect("exists");
        assert_eq!(copy.has_file, HasFile::Yes);
        assert_eq!(copy.wants_file, WantsFile::Yes);

        let again = importer
            .import_file(&node, ACQ, "00000000_0000.h5")
            .await
            .expect("import");
        assert_eq!(again, ImportOutcome::AlreadyRegistered);
        assert_eq!(store.all_copies().await.len(), 1);
    }

    #[tokio::test]
    async fn test_import_honors_lock_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, node) = setup(dir.path().to_path_buf()).await;
        std::fs::create_dir_all(dir.path().join(ACQ)).expect("mkdir");
        std::fs::write(dir.path().join(ACQ).join("a.h5"), b"partial").expect("write");
        std::fs::write(dir.path().join(ACQ).join(".a.h5.lock"), b"").expect("write");

        let importer = Importer::new(store.clone(), ExtractorRegistry::new(), fast_retry());
        let outcome = importer.import_file(&node, ACQ, "a.h5").await.expect("import");
        assert_eq!(outcome, ImportOutcome::Locked);
        assert!(store.find_acquisition(ACQ).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_import_ignores_non_acquisitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, node) = setup(dir.path().to_path_buf()).await;
        std::fs::create_dir_all(dir.path().join("scratch")).expect("mkdir");
        std::fs::write(dir.path().join("scratch").join("notes.txt"), b"x").expect("write");

        let importer = Importer::new(store.clone(), ExtractorRegistry::new(), fast_retry());
        let outcome = importer
            .import_file(&node, "scratch", "notes.txt")
            .await
            .expect("import");
        assert_eq!(outcome, ImportOutcome::NotAcquisition);
    }

    #[tokio::test]
    async fn test_import_flags_mismatch_with_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, node) = setup(dir.path().to_path_buf()).await;
        let acq = store.ensure_acquisition(ACQ).await.expect("acq");
        let _ = store
            .ensure_file(acq.id, "b.h5", 12, "00000000000000000000000000000000")
            .await
            .expect("file");
        std::fs::create_dir_all(dir.path().join(ACQ)).expect("mkdir");
        std::fs::write(dir.path().join(ACQ).join("b.h5"), b"hello world\n").expect("write");

        let importer = Importer::new(store.clone(), ExtractorRegistry::new(), fast_retry());
        let outcome = importer.import_file(&node, ACQ, "b.h5").await.expect("import");
        let ImportOutcome::Registered { file, suspect, .. } = outcome else {
            panic!("expected registration");
        };
        assert!(suspect);
        let copy = store.copy(file.id, node.id).await.expect("copy").expect("exists");
        assert_eq!(copy.has_file, HasFile::MaybeCorrupt);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ExtractorRegistry::new();
        assert!(registry.get("corr").is_none());
        registry.register("corr", Arc::new(FixedExtractor));
        registry.register("hk", Arc::new(FixedExtractor));
        assert!(registry.get("corr").is_some());
        assert_eq!(registry.type_tags(), vec!["corr", "hk"]);
    }
}
