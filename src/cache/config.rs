//! Cache identity, strategy and on-disk location.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::CacheError;

/// Default byte limit for a cache id before it is shortened.
pub const DEFAULT_CACHE_MAX_FILENAME_LENGTH: usize = 200;

/// Cache file extension.
pub const CACHE_FILE_EXT: &str = ".cache.yaml";

/// How cached results are read and persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Use matches; keep writes in memory only.
    ReadOnly,
    #[default]
    ReadWrite,
    /// Never use matches; record and persist writes.
    WriteOnly,
}

impl CacheStrategy {
    pub const ALL: [CacheStrategy; 3] = [Self::ReadOnly, Self::ReadWrite, Self::WriteOnly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::ReadWrite => "read-write",
            Self::WriteOnly => "write-only",
        }
    }

    pub fn uses_results(self) -> bool {
        self != Self::WriteOnly
    }

    pub fn persists_writes(self) -> bool {
        self != Self::ReadOnly
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == needle)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|s| s.as_str()).collect();
                CacheError::InvalidConfig(format!(
                    "unknown cache strategy \"{}\", expected one of: {}",
                    s,
                    valid.join(", ")
                ))
            })
    }
}

/// Configuration for one cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub id: String,
    pub strategy: CacheStrategy,
    /// Directory holding cache files. `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    pub max_filename_length: usize,
}

impl CacheConfig {
    /// Create a config for `id`, persisted under the default cache directory.
    pub fn new(id: impl Into<String>) -> Result<Self, CacheError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CacheError::InvalidConfig("cache id is required".to_string()));
        }
        Ok(Self {
            id,
            strategy: CacheStrategy::default(),
            cache_dir: default_cache_dir(),
            max_filename_length: DEFAULT_CACHE_MAX_FILENAME_LENGTH,
        })
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Keep records in memory only.
    pub fn in_memory(mut self) -> Self {
        self.cache_dir = None;
        self
    }

    pub fn with_max_filename_length(mut self, max: usize) -> Self {
        if max > 0 {
            self.max_filename_length = max;
        }
        self
    }

    /// Id safe to use as a file name.
    pub fn safe_id(&self) -> String {
        sanitize_cache_id(&self.id, self.max_filename_length)
    }

    /// Full path of the cache file, if persisted.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}{}", self.safe_id(), CACHE_FILE_EXT)))
    }
}

/// Platform cache directory for engine cache files.
pub fn default_cache_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "moderras", "ui-agent")
        .map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Replace path-illegal characters and whitespace with `-`, then shorten
/// ids longer than `max_len` bytes to `<first 32 chars>-<hash>`.
pub fn sanitize_cache_id(id: &str, max_len: usize) -> String {
    let safe: String = id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_whitespace() || c.is_control() => '-',
            c => c,
        })
        .collect();

    if safe.len() <= max_len {
        return safe;
    }

    let prefix: String = safe.chars().take(32).collect();
    format!("{}-{:016x}", prefix, fnv1a64(safe.as_bytes()))
}

/// 64-bit FNV-1a. Fixed so shortened ids map to the same file across builds.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!("read-only".parse::<CacheStrategy>().unwrap(), CacheStrategy::ReadOnly);
        assert_eq!(" Write-Only ".parse::<CacheStrategy>().unwrap(), CacheStrategy::WriteOnly);
        let err = "sometimes".parse::<CacheStrategy>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("read-only, read-write, write-only"), "{}", msg);
    }

    #[test]
    fn test_strategy_flags() {
        assert!(CacheStrategy::ReadOnly.uses_results());
        assert!(!CacheStrategy::ReadOnly.persists_writes());
        assert!(!CacheStrategy::WriteOnly.uses_results());
        assert!(CacheStrategy::WriteOnly.persists_writes());
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(CacheConfig::new("  ").is_err());
    }

    #[test]
    fn test_sanitize_replaces_illegal_chars() {
        assert_eq!(sanitize_cache_id("login flow/step:1", 200), "login-flow-step-1");
    }

    #[test]
    fn test_sanitize_shortens_long_ids() {
        let long = "a".repeat(300);
        let safe = sanitize_cache_id(&long, 200);
        assert!(safe.starts_with(&"a".repeat(32)));
        assert_eq!(safe.len(), 32 + 1 + 16);
        assert_eq!(safe, sanitize_cache_id(&long, 200));
        assert_eq!(safe, format!("{}-ee7717eba7a17e21", "a".repeat(32)));
    }

    #[test]
    fn test_fnv1a64_known_values() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_file_path() {
        let config = CacheConfig::new("my test")
            .unwrap()
            .with_cache_dir("/tmp/cache");
        assert_eq!(
            config.file_path().unwrap(),
            PathBuf::from("/tmp/cache/my-test.cache.yaml")
        );
        assert!(config.in_memory().file_path().is_none());
    }
}
