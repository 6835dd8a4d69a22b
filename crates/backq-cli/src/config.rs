//! デモの設定ファイル（JSON）
//!
//! 引数で渡されたパスから読みます。省略したフィールドはデフォルト値になります。
//!
//! ```json
//! {
//!   "servers": 3,
//!   "packages": 5,
//!   "constants": { "task_emulator_delay_ms": 50 }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use backq_core::domain::{ConstantsSet, EventKeyNames};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of back-servers competing for the pool.
    pub servers: usize,
    pub packages: usize,
    pub tasks_per_package: usize,
    pub poll_interval_ms: u64,
    /// Lifetime of pool entries and payload hashes.
    pub package_ttl_ms: u64,
    /// Give up waiting for completions after this long.
    pub deadline_ms: u64,
    /// Value an operator pushes through the update key once packages are in.
    pub updated_task_delay_ms: Option<u32>,
    pub keys: EventKeyNames,
    pub constants: ConstantsSet,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            servers: 3,
            packages: 6,
            tasks_per_package: 4,
            poll_interval_ms: 100,
            package_ttl_ms: 60_000,
            deadline_ms: 30_000,
            updated_task_delay_ms: Some(20),
            keys: EventKeyNames {
                progress_prefix: "progress:".to_string(),
                ..EventKeyNames::default()
            },
            constants: ConstantsSet {
                task_emulator_delay_ms: 50,
                ..ConstantsSet::default()
            },
        }
    }
}

impl DemoConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
