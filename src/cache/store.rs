//! Plan and locate records keyed by prompt, persisted as YAML.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::config::{CacheConfig, CacheStrategy};
use super::CacheError;
use crate::types::ElementCacheFeature;

/// Version written into new cache files.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Files written by older engines carry descriptors this engine cannot match.
pub const LOWEST_SUPPORTED_ENGINE_VERSION: &str = "0.1.0";

/// A replayable workflow for a free-text instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningCache {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaml_workflow: Option<String>,
}

impl PlanningCache {
    /// The workflow, if it has any content once trimmed.
    pub fn usable_workflow(&self) -> Option<&str> {
        self.yaml_workflow
            .as_deref()
            .filter(|workflow| !workflow.trim().is_empty())
    }
}

/// A feature descriptor for a locate prompt. `cache: None` is a negative record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateCache {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<ElementCacheFeature>,
    /// Pre-descriptor files stored xpaths at the top level.
    #[serde(default, skip_serializing)]
    pub xpaths: Option<Vec<String>>,
}

impl LocateCache {
    fn migrate_legacy(&mut self) {
        if let Some(xpaths) = self.xpaths.take() {
            if self.cache.is_none() {
                self.cache = Some(ElementCacheFeature::from_xpaths(xpaths));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheRecord {
    Plan(PlanningCache),
    Locate(LocateCache),
}

impl CacheRecord {
    pub fn prompt(&self) -> &str {
        match self {
            Self::Plan(record) => &record.prompt,
            Self::Locate(record) => &record.prompt,
        }
    }

    fn key(&self) -> RecordKey {
        match self {
            Self::Plan(record) => (RecordKind::Plan, record.prompt.clone()),
            Self::Locate(record) => (RecordKind::Locate, record.prompt.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RecordKind {
    Plan,
    Locate,
}

type RecordKey = (RecordKind, String);

/// On-disk cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFileContent {
    pub engine_version: String,
    pub cache_id: String,
    #[serde(default)]
    pub caches: Vec<CacheRecord>,
}

impl CacheFileContent {
    pub fn new(cache_id: impl Into<String>) -> Self {
        Self {
            engine_version: ENGINE_VERSION.to_string(),
            cache_id: cache_id.into(),
            caches: Vec::new(),
        }
    }

    /// Drop empty plan workflows and negative locate records. Returns the number removed.
    pub fn prune(&mut self) -> usize {
        let before = self.caches.len();
        self.caches.retain(|record| match record {
            CacheRecord::Plan(plan) => plan.usable_workflow().is_some(),
            CacheRecord::Locate(locate) => locate
                .cache
                .as_ref()
                .is_some_and(|feature| !feature.is_empty()),
        });
        before - self.caches.len()
    }
}

/// Read a cache file, migrating legacy locate records.
pub fn load_cache_file(path: &Path) -> Result<CacheFileContent, CacheError> {
    let data = fs::read_to_string(path)?;
    let mut content: CacheFileContent = serde_yaml::from_str(&data)?;

    if !version_supported(&content.engine_version) {
        return Err(CacheError::UnsupportedVersion {
            found: content.engine_version,
            lowest: LOWEST_SUPPORTED_ENGINE_VERSION.to_string(),
        });
    }

    for record in &mut content.caches {
        if let CacheRecord::Locate(locate) = record {
            locate.migrate_legacy();
        }
    }
    content.engine_version = ENGINE_VERSION.to_string();
    Ok(content)
}

/// Write a cache file with plan records ahead of locate records.
pub fn save_cache_file(path: &Path, content: &CacheFileContent) -> Result<(), CacheError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
            tracing::debug!("Created cache directory: {}", dir.display());
        }
    }

    let mut sorted = content.clone();
    // Stable sort keeps insertion order within each kind.
    sorted
        .caches
        .sort_by_key(|record| matches!(record, CacheRecord::Locate(_)));

    fs::write(path, serde_yaml::to_string(&sorted)?)?;
    Ok(())
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.').map(|p| p.parse::<u64>().ok());
    Some((parts.next()??, parts.next()??, parts.next()??))
}

fn version_supported(version: &str) -> bool {
    if version.contains("beta") {
        return true;
    }
    match (
        parse_version(version),
        parse_version(LOWEST_SUPPORTED_ENGINE_VERSION),
    ) {
        (Some(found), Some(lowest)) => found >= lowest,
        _ => false,
    }
}

struct CacheState {
    content: CacheFileContent,
    /// Records matched or written this session.
    touched: HashSet<RecordKey>,
}

/// Cache Store: one instance per execution session, shared as `Arc<TaskCache>`.
pub struct TaskCache {
    config: CacheConfig,
    file_path: Option<PathBuf>,
    state: Mutex<CacheState>,
}

impl TaskCache {
    /// Open the cache described by `config`, loading its file when present.
    pub fn new(config: CacheConfig) -> Self {
        let file_path = config.file_path();
        Self::open(config, file_path)
    }

    /// Open the cache at an explicit file path.
    pub fn with_file_path(config: CacheConfig, path: impl Into<PathBuf>) -> Self {
        Self::open(config, Some(path.into()))
    }

    /// A cache that never touches disk.
    pub fn in_memory(id: impl Into<String>) -> Result<Self, CacheError> {
        Ok(Self::open(CacheConfig::new(id)?.in_memory(), None))
    }

    fn open(config: CacheConfig, file_path: Option<PathBuf>) -> Self {
        let cache_id = config.safe_id();
        let content = file_path
            .as_deref()
            .and_then(|path| Self::load_existing(path))
            .unwrap_or_else(|| CacheFileContent::new(cache_id.clone()));

        Self {
            config,
            file_path,
            state: Mutex::new(CacheState {
                content,
                touched: HashSet::new(),
            }),
        }
    }

    fn load_existing(path: &Path) -> Option<CacheFileContent> {
        if !path.exists() {
            tracing::debug!("No cache file found at {}", path.display());
            return None;
        }
        match load_cache_file(path) {
            Ok(content) => {
                tracing::debug!(
                    "Cache loaded from {} ({} records)",
                    path.display(),
                    content.caches.len()
                );
                Some(content)
            }
            Err(CacheError::UnsupportedVersion { found, lowest }) => {
                tracing::warn!(
                    "Ignoring cache file {} written by engine {} (lowest supported {}); delete it to rebuild",
                    path.display(),
                    found,
                    lowest
                );
                None
            }
            Err(e) => {
                tracing::debug!("Cache file {} exists but failed to load: {}", path.display(), e);
                None
            }
        }
    }

    pub fn cache_id(&self) -> String {
        self.state.lock().content.cache_id.clone()
    }

    pub fn strategy(&self) -> CacheStrategy {
        self.config.strategy
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Whether matches may be used to skip work.
    pub fn is_cache_result_used(&self) -> bool {
        self.config.strategy.uses_results()
    }

    /// Look up the replayable workflow for `prompt`.
    pub fn match_plan_cache(&self, prompt: &str) -> Option<PlanningCache> {
        if !self.is_cache_result_used() {
            return None;
        }
        let mut state = self.state.lock();
        let found = state.content.caches.iter().find_map(|record| match record {
            CacheRecord::Plan(plan) if plan.prompt == prompt => Some(plan.clone()),
            _ => None,
        });
        match found {
            Some(plan) => {
                state.touched.insert((RecordKind::Plan, prompt.to_string()));
                tracing::debug!("Plan cache hit for \"{}\"", prompt);
                Some(plan)
            }
            None => {
                tracing::debug!("Plan cache miss for \"{}\"", prompt);
                None
            }
        }
    }

    /// Look up the locate record for `prompt`. Never consulted when
    /// `cacheable` is false.
    pub fn match_locate_cache(&self, prompt: &str, cacheable: bool) -> Option<LocateCache> {
        if !cacheable || !self.is_cache_result_used() {
            return None;
        }
        let mut state = self.state.lock();
        let found = state.content.caches.iter_mut().find_map(|record| match record {
            CacheRecord::Locate(locate) if locate.prompt == prompt => {
                locate.migrate_legacy();
                Some(locate.clone())
            }
            _ => None,
        });
        match found {
            Some(locate) => {
                state.touched.insert((RecordKind::Locate, prompt.to_string()));
                tracing::debug!("Locate cache hit for \"{}\"", prompt);
                Some(locate)
            }
            None => {
                tracing::debug!("Locate cache miss for \"{}\"", prompt);
                None
            }
        }
    }

    /// Whether any locate record exists for `prompt`, regardless of strategy.
    pub fn has_locate_record(&self, prompt: &str) -> bool {
        self.locate_record(prompt).is_some()
    }

    /// The stored locate record for `prompt`, without marking it used.
    pub fn locate_record(&self, prompt: &str) -> Option<LocateCache> {
        self.state
            .lock()
            .content
            .caches
            .iter()
            .find_map(|record| match record {
                CacheRecord::Locate(locate) if locate.prompt == prompt => Some(locate.clone()),
                _ => None,
            })
    }

    /// Store or overwrite the descriptor for `prompt`.
    pub fn write_locate_cache(
        &self,
        prompt: &str,
        feature: Option<ElementCacheFeature>,
    ) -> Result<(), CacheError> {
        self.upsert(CacheRecord::Locate(LocateCache {
            prompt: prompt.to_string(),
            cache: feature,
            xpaths: None,
        }))
    }

    /// Store or overwrite the workflow for `prompt`.
    pub fn write_plan_cache(&self, prompt: &str, yaml_workflow: &str) -> Result<(), CacheError> {
        self.upsert(CacheRecord::Plan(PlanningCache {
            prompt: prompt.to_string(),
            yaml_workflow: Some(yaml_workflow.to_string()),
        }))
    }

    fn upsert(&self, record: CacheRecord) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let key = record.key();
        match state
            .content
            .caches
            .iter_mut()
            .find(|existing| existing.key() == key)
        {
            Some(existing) => {
                tracing::debug!("Overwriting {:?} cache record for \"{}\"", key.0, key.1);
                *existing = record;
            }
            None => {
                tracing::debug!("Appending {:?} cache record for \"{}\"", key.0, key.1);
                state.content.caches.push(record);
            }
        }
        state.touched.insert(key);

        if !self.config.strategy.persists_writes() {
            tracing::debug!("Read-only cache, record kept in memory only");
            return Ok(());
        }
        self.persist(&state)
    }

    /// Snapshot of all records.
    pub fn records(&self) -> Vec<CacheRecord> {
        self.state.lock().content.caches.clone()
    }

    /// Write the cache to its file, optionally dropping records that were
    /// neither matched nor written this session.
    pub fn flush(&self, clean_unused: bool) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        if clean_unused {
            let CacheState { content, touched } = &mut *state;
            let before = content.caches.len();
            content.caches.retain(|record| touched.contains(&record.key()));
            tracing::debug!(
                "Removed {} unused cache records",
                before - content.caches.len()
            );
        }
        if !self.config.strategy.persists_writes() {
            tracing::debug!("Read-only cache, skipping flush");
            return Ok(());
        }
        self.persist(&state)
    }

    fn persist(&self, state: &CacheState) -> Result<(), CacheError> {
        let Some(path) = self.file_path.as_deref() else {
            return Ok(());
        };
        save_cache_file(path, &state.content)?;
        tracing::debug!("Cache flushed to {}", path.display());
        Ok(())
    }
}
