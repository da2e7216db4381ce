use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::db::error::{DbError, DbResult};
use crate::storage::BackendConfig;

/// When superseded revisions are purged after a bulk write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutoCompaction {
    /// Only on explicit compaction.
    #[default]
    Disabled,
    /// Inside the bulk write's own transaction.
    Inline,
    /// In a background task right after the bulk write commits.
    Deferred,
}

impl AutoCompaction {
    pub fn as_str(self) -> &'static str {
        match self {
            AutoCompaction::Disabled => "disabled",
            AutoCompaction::Inline => "inline",
            AutoCompaction::Deferred => "deferred",
        }
    }

    pub fn is_enabled(self) -> bool {
        self != AutoCompaction::Disabled
    }
}

impl fmt::Display for AutoCompaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutoCompaction {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" | "off" | "false" => Ok(AutoCompaction::Disabled),
            "inline" | "on" | "true" => Ok(AutoCompaction::Inline),
            "deferred" => Ok(AutoCompaction::Deferred),
            other => Err(DbError::BadArgument(format!(
                "unknown auto compaction policy: {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Database name; live change listeners are keyed by it.
    pub name: String,
    pub data_dir: PathBuf,
    /// Maximum generations kept per revision path.
    pub revs_limit: usize,
    pub auto_compaction: AutoCompaction,
    pub cache_size_mb: u64,
    pub flush_interval_ms: u64,
    /// Capacity of each live change feed's delivery channel.
    pub live_buffer: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "sofadb".to_string(),
            data_dir: PathBuf::from("./data"),
            revs_limit: 1000,
            auto_compaction: AutoCompaction::Disabled,
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            live_buffer: 64,
        }
    }
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_revs_limit(mut self, revs_limit: usize) -> Self {
        self.revs_limit = revs_limit;
        self
    }

    pub fn with_auto_compaction(mut self, policy: AutoCompaction) -> Self {
        self.auto_compaction = policy;
        self
    }

    pub fn with_cache(mut self, cache_size_mb: u64, flush_interval_ms: u64) -> Self {
        self.cache_size_mb = cache_size_mb;
        self.flush_interval_ms = flush_interval_ms;
        self
    }

    pub fn with_live_buffer(mut self, live_buffer: usize) -> Self {
        self.live_buffer = live_buffer;
        self
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.name.is_empty() {
            return Err(DbError::BadArgument(
                "database name must not be empty".to_string(),
            ));
        }

        if self.revs_limit == 0 {
            return Err(DbError::BadArgument(
                "revs_limit must be greater than 0".to_string(),
            ));
        }

        if self.live_buffer == 0 {
            return Err(DbError::BadArgument(
                "live_buffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub(crate) fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            data_dir: self.data_dir.clone(),
            cache_size_mb: self.cache_size_mb,
            flush_interval_ms: self.flush_interval_ms,
            ..Default::default()
        }
    }
}
