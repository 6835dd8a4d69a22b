//! EmulatedSpawner - 進捗を書き込むだけのタスク実行エミュレータ
//!
//! 本物の executor の代わりに、store へ progress record と未完了カウンタを書き込みます。
//! CLI のデモとテストで WorkerLoop を最後まで動かすために使います。
//!
//! # 書き込む内容
//! - `{progress_key}`: タスクごとに `TaskProgress`（-1 → 0..100 → 100/not-running）
//! - `{server_prefix}` / package: 未完了タスク数（タスクが終わるたびに減らす）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{
    BackqError, CapturedPackage, ConstantsSet, EventKeyNames, ProcessPlan, TaskProgress,
};
use crate::ports::{CoordinationStore, PackageSpawner};

/// Progress written per step (percent points).
const STEP_PERCENT: i32 = 25;

pub struct EmulatedSpawner {
    store: Arc<dyn CoordinationStore>,
    cancel: CancellationToken,
    /// Guards read-modify-write of unsolved counters across emulated tasks.
    counter_lock: Arc<Mutex<()>>,
}

impl EmulatedSpawner {
    /// 新しい EmulatedSpawner を作成
    ///
    /// `cancel` が発火すると、起動済みのエミュレートされたタスクも止まります。
    pub fn new(store: Arc<dyn CoordinationStore>, cancel: CancellationToken) -> Self {
        Self {
            store,
            cancel,
            counter_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl PackageSpawner for EmulatedSpawner {
    async fn spawn(
        &self,
        package: &CapturedPackage,
        plan: ProcessPlan,
        keys: &EventKeyNames,
        constants: &ConstantsSet,
    ) -> Result<(), BackqError> {
        let tasks: Vec<String> = {
            let mut tasks: Vec<String> = self
                .store
                .get_all_hash_fields(&package.payload)
                .await?
                .into_keys()
                .collect();
            tasks.sort_unstable();
            tasks
        };
        if tasks.is_empty() {
            return Err(BackqError::Spawn {
                package: package.id.to_string(),
                reason: format!("payload hash {} holds no tasks", package.payload),
            });
        }
        let progress_key = keys.progress_key(&package.id);
        let counter_key = keys.server_prefix.clone();
        let field = package.id.to_string();

        // 全タスクを「未開始」で登録してからカウンタを立てる
        let not_started = encode(&TaskProgress::not_started())?;
        for task in &tasks {
            self.store
                .set_hash_field(&progress_key, task, &not_started, None)
                .await?;
        }
        self.store
            .set_hash_field(&counter_key, &field, &tasks.len().to_string(), None)
            .await?;
        debug!(package = %package.id, tasks = tasks.len(), processes = plan.processes, "emulated package spawned");

        // process ごとにタスクを round-robin で割り当てる
        let processes = plan.processes.max(1) as usize;
        let delay = constants.task_emulator_delay();
        for process in 0..processes {
            let assigned: Vec<String> = tasks
                .iter()
                .skip(process)
                .step_by(processes)
                .cloned()
                .collect();
            if assigned.is_empty() {
                continue;
            }
            let worker = EmulatedProcess {
                store: Arc::clone(&self.store),
                cancel: self.cancel.clone(),
                counter_lock: Arc::clone(&self.counter_lock),
                progress_key: progress_key.clone(),
                counter_key: counter_key.clone(),
                field: field.clone(),
                delay,
            };
            tokio::spawn(async move {
                if let Err(e) = worker.run(assigned).await {
                    warn!("emulated process failed: {e}");
                }
            });
        }
        Ok(())
    }
}

struct EmulatedProcess {
    store: Arc<dyn CoordinationStore>,
    cancel: CancellationToken,
    counter_lock: Arc<Mutex<()>>,
    progress_key: String,
    counter_key: String,
    field: String,
    delay: Duration,
}

impl EmulatedProcess {
    async fn run(self, tasks: Vec<String>) -> Result<(), BackqError> {
        for task in tasks {
            let mut percent = 0;
            while percent < 100 {
                self.write(&task, TaskProgress::running(percent)).await?;
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.delay) => {}
                }
                percent += STEP_PERCENT;
            }
            self.decrement_counter().await?;
            self.write(&task, TaskProgress::finished()).await?;
        }
        Ok(())
    }

    async fn write(&self, task: &str, progress: TaskProgress) -> Result<(), BackqError> {
        let value = encode(&progress)?;
        self.store
            .set_hash_field(&self.progress_key, task, &value, None)
            .await?;
        Ok(())
    }

    async fn decrement_counter(&self) -> Result<(), BackqError> {
        let _lock = self.counter_lock.lock().await;
        let current = self
            .store
            .get_hash_field(&self.counter_key, &self.field)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0);
        let next = (current - 1).max(0);
        self.store
            .set_hash_field(&self.counter_key, &self.field, &next.to_string(), None)
            .await?;
        Ok(())
    }
}

fn encode(progress: &TaskProgress) -> Result<String, BackqError> {
    serde_json::to_string(progress).map_err(BackqError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ProgressAggregator;
    use crate::domain::PackageId;
    use crate::impls::InMemoryCoordinationStore;

    #[tokio::test]
    async fn emulated_package_runs_to_completion() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        for task in ["t1", "t2", "t3"] {
            store.set_hash_field("payload-1", task, "{}", None).await.unwrap();
        }
        let keys = EventKeyNames {
            server_prefix: "back-server:test".to_string(),
            ..EventKeyNames::default()
        };
        let constants = ConstantsSet {
            task_emulator_delay_ms: 5,
            ..ConstantsSet::default()
        };
        let package = CapturedPackage {
            id: PackageId::new("pkg-1"),
            payload: "payload-1".to_string(),
        };

        let spawner = EmulatedSpawner::new(store.clone(), CancellationToken::new());
        let plan = ProcessPlan::for_task_count(3, &constants);
        spawner.spawn(&package, plan, &keys, &constants).await.unwrap();

        let aggregator = ProgressAggregator::new(store.clone());
        let done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if aggregator.is_completed(&keys, &package.id).await.unwrap() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(done.is_ok(), "package did not complete");
        assert!(!aggregator.check_package_liveness(&keys, &package.id).await.unwrap());
    }

    #[tokio::test]
    async fn empty_payload_is_refused() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let spawner = EmulatedSpawner::new(store.clone(), CancellationToken::new());
        let constants = ConstantsSet::default();
        let package = CapturedPackage {
            id: PackageId::new("pkg-1"),
            payload: "payload-missing".to_string(),
        };

        let err = spawner
            .spawn(
                &package,
                ProcessPlan::for_task_count(0, &constants),
                &EventKeyNames::default(),
                &constants,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BackqError::Spawn { ref package, .. } if package == "pkg-1"));
        assert!(!store.key_exists("pkg-1").await.unwrap());
    }
}
