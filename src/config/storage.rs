//! Storage configuration types.

use serde::Deserialize;

/// SQLite ledger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path. Created if missing.
    pub path: String,
    /// Pool size.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing BUSY.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "loyalty.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    /// Config for a database file at `path`, other settings default.
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}
