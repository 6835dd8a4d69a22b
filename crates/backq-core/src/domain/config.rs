//! Config - キー名とチューニング値
//!
//! # 2 つの束
//! - **EventKeyNames**: store 上のキー名（pool key、server ごとの未完了カウンタ、progress key）
//! - **ConstantsSet**: バージョン付きのチューニング値（ConstantsReloader が hot-update する）
//!
//! どちらも core の操作にそのまま渡され、core はフィールドを読むだけで書き換えません。
//! 書き換えは `ConstantsSet::apply` を通した ConstantsReloader だけが行います。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::events::KeyEventKind;
use super::ids::{PackageId, ServerId};

/// Store key names used by one back-server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventKeyNames {
    /// Hash of unclaimed packages: field = package id, value = payload key.
    pub pool_key: String,
    /// Hash of unsolved-task counters owned by this server: field = package id.
    pub server_prefix: String,
    /// Prepended to a package id to form its progress hash key.
    pub progress_prefix: String,
}

impl Default for EventKeyNames {
    fn default() -> Self {
        Self {
            pool_key: "key-event-front-server-gives-task-package".to_string(),
            server_prefix: "back-server".to_string(),
            progress_prefix: String::new(),
        }
    }
}

impl EventKeyNames {
    /// Per-server counter key: `{server_prefix}:{server_id}`.
    pub fn for_server(mut self, server_id: ServerId) -> Self {
        self.server_prefix = format!("{}:{}", self.server_prefix, server_id);
        self
    }

    pub fn progress_key(&self, package: &PackageId) -> String {
        format!("{}{}", self.progress_prefix, package)
    }
}

/// A store key plus the lifetime attached to it, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedKey {
    pub name: String,
    pub lifetime_ms: u64,
}

impl TimedKey {
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }
}

/// Versioned tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstantsSet {
    pub record_actuality_level: u32,
    pub task_emulator_delay_ms: u32,
    /// Upper bound (exclusive) of the dice-roll draw.
    pub random_range_extended: u32,
    /// Tasks per process when sizing a package's process plan.
    pub balance_of_tasks_and_processes: u32,
    pub max_processes_count_on_server: u32,
    pub min_back_processes_servers_count: u32,

    /// Key under which the published set is stored.
    pub version_base: TimedKey,
    /// Bumped on every published update.
    pub version_number: u64,
    /// Key an operator writes `ConstantKey -> value` fields into.
    /// Its lifetime doubles as the minimum interval between two reload cycles.
    pub update_key: TimedKey,
    /// Notification kind on `update_key` that triggers a reload.
    pub update_event: KeyEventKind,
}

impl Default for ConstantsSet {
    fn default() -> Self {
        Self {
            record_actuality_level: 6,
            task_emulator_delay_ms: 200,
            random_range_extended: 100,
            balance_of_tasks_and_processes: 2,
            max_processes_count_on_server: 8,
            min_back_processes_servers_count: 1,
            version_base: TimedKey {
                name: "constants".to_string(),
                lifetime_ms: 24 * 60 * 60 * 1000,
            },
            version_number: 0,
            update_key: TimedKey {
                name: "constants:update".to_string(),
                lifetime_ms: 1000,
            },
            update_event: KeyEventKind::HashSet,
        }
    }
}

impl ConstantsSet {
    /// Typed setter table for the updatable tunables.
    pub fn apply(&mut self, key: ConstantKey, value: u32) {
        let slot = match key {
            ConstantKey::RecordActualityLevel => &mut self.record_actuality_level,
            ConstantKey::TaskEmulatorDelayTimeInMilliseconds => &mut self.task_emulator_delay_ms,
            ConstantKey::RandomRangeExtended => &mut self.random_range_extended,
            ConstantKey::BalanceOfTasksAndProcesses => &mut self.balance_of_tasks_and_processes,
            ConstantKey::MaxProcessesCountOnServer => &mut self.max_processes_count_on_server,
            ConstantKey::MinBackProcessesServersCount => {
                &mut self.min_back_processes_servers_count
            }
        };
        *slot = value;
    }

    pub fn get(&self, key: ConstantKey) -> u32 {
        match key {
            ConstantKey::RecordActualityLevel => self.record_actuality_level,
            ConstantKey::TaskEmulatorDelayTimeInMilliseconds => self.task_emulator_delay_ms,
            ConstantKey::RandomRangeExtended => self.random_range_extended,
            ConstantKey::BalanceOfTasksAndProcesses => self.balance_of_tasks_and_processes,
            ConstantKey::MaxProcessesCountOnServer => self.max_processes_count_on_server,
            ConstantKey::MinBackProcessesServersCount => self.min_back_processes_servers_count,
        }
    }

    pub fn task_emulator_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.task_emulator_delay_ms))
    }
}

/// Names an operator may use as fields of the update key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantKey {
    RecordActualityLevel,
    TaskEmulatorDelayTimeInMilliseconds,
    RandomRangeExtended,
    BalanceOfTasksAndProcesses,
    MaxProcessesCountOnServer,
    MinBackProcessesServersCount,
}

impl ConstantKey {
    pub const ALL: [ConstantKey; 6] = [
        ConstantKey::RecordActualityLevel,
        ConstantKey::TaskEmulatorDelayTimeInMilliseconds,
        ConstantKey::RandomRangeExtended,
        ConstantKey::BalanceOfTasksAndProcesses,
        ConstantKey::MaxProcessesCountOnServer,
        ConstantKey::MinBackProcessesServersCount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConstantKey::RecordActualityLevel => "RecordActualityLevel",
            ConstantKey::TaskEmulatorDelayTimeInMilliseconds => {
                "TaskEmulatorDelayTimeInMilliseconds"
            }
            ConstantKey::RandomRangeExtended => "RandomRangeExtended",
            ConstantKey::BalanceOfTasksAndProcesses => "BalanceOfTasksAndProcesses",
            ConstantKey::MaxProcessesCountOnServer => "MaxProcessesCountOnServer",
            ConstantKey::MinBackProcessesServersCount => "MinBackProcessesServersCount",
        }
    }
}

impl fmt::Display for ConstantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The field name is not one of the updatable tunables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown constant key: {0}")]
pub struct UnknownConstantKey(pub String);

impl FromStr for ConstantKey {
    type Err = UnknownConstantKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConstantKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnknownConstantKey(s.to_string()))
    }
}

/// How many executor processes a captured package gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessPlan {
    pub task_count: usize,
    pub processes: u32,
}

impl ProcessPlan {
    /// `task_count / balance`, at least one process and at most the per-server ceiling.
    pub fn for_task_count(task_count: usize, constants: &ConstantsSet) -> Self {
        let balance = constants.balance_of_tasks_and_processes.max(1) as usize;
        let ceiling = constants.max_processes_count_on_server.max(1);
        let wanted = u32::try_from(task_count / balance).unwrap_or(u32::MAX);
        Self {
            task_count,
            processes: wanted.clamp(1, ceiling),
        }
    }
}
