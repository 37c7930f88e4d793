//! Cache Store: plan workflows and locate descriptors, keyed by prompt.

mod config;
mod store;

use thiserror::Error;

pub use config::{
    default_cache_dir, sanitize_cache_id, CacheConfig, CacheStrategy, CACHE_FILE_EXT,
    DEFAULT_CACHE_MAX_FILENAME_LENGTH,
};
pub use store::{
    load_cache_file, save_cache_file, CacheFileContent, CacheRecord, LocateCache, PlanningCache,
    TaskCache, ENGINE_VERSION, LOWEST_SUPPORTED_ENGINE_VERSION,
};

/// Cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache file is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid cache config: {0}")]
    InvalidConfig(String),
    #[error("Cache file version {found} is older than the lowest supported {lowest}")]
    UnsupportedVersion { found: String, lowest: String },
}
