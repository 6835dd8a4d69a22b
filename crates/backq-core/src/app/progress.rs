//! ProgressAggregator - 捕獲したパッケージの完了判定
//!
//! # 2 つの判定
//! - **check_all_tasks_completion**: progress hash を全件読んで集計（正確）
//! - **check_package_liveness**: server の未完了カウンタ 1 つを読む（安価なヒント）
//!
//! 2 つは別々の writer が更新するので、一時的に食い違うことがあります。
//! 完了を確定させたいときは前者を使います。

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{BackqError, EventKeyNames, PackageId, PackageProgress, TaskProgress};
use crate::ports::CoordinationStore;

pub struct ProgressAggregator {
    store: Arc<dyn CoordinationStore>,
}

impl ProgressAggregator {
    /// 新しい ProgressAggregator を作成
    ///
    /// 状態は持たず、呼び出しごとに store を読み直します。
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Scan every task progress record of `package`.
    ///
    /// - A running record marks the package incomplete; the scan goes on.
    /// - A not-started record (`completedPercent < 0`) ends the scan at once.
    /// - Otherwise the truncated mean percent is computed (informational only).
    ///
    /// An empty snapshot yields `task_count == 0`, which is never complete.
    pub async fn check_all_tasks_completion(
        &self,
        keys: &EventKeyNames,
        package: &PackageId,
    ) -> Result<PackageProgress, BackqError> {
        let progress_key = keys.progress_key(package);
        let records = self.store.get_all_hash_fields(&progress_key).await?;
        let task_count = records.len();
        debug!(package = %package, task_count, "task progress fetched");

        let mut progress = PackageProgress {
            task_count,
            ..PackageProgress::default()
        };
        if task_count == 0 {
            return Ok(progress);
        }

        let mut sum: i64 = 0;
        for (task, raw) in &records {
            let record: TaskProgress = serde_json::from_str(raw).map_err(|source| {
                BackqError::MalformedProgress {
                    key: progress_key.clone(),
                    field: task.clone(),
                    source,
                }
            })?;

            if record.is_running {
                progress.any_running = true;
            }
            if !record.is_started() {
                debug!(package = %package, task = %task, "task not started yet");
                progress.not_started = true;
                return Ok(progress);
            }
            sum += i64::from(record.completed_percent);
            debug!(package = %package, task = %task, percent = record.completed_percent, "task progress");
        }

        let average = (sum as f64 / task_count as f64) as i32;
        progress.percent = Some(average);
        info!(
            package = %package,
            percent = average,
            completed = progress.is_completed(),
            "task package progress aggregated"
        );
        Ok(progress)
    }

    /// `check_all_tasks_completion(..).is_completed()`.
    pub async fn is_completed(
        &self,
        keys: &EventKeyNames,
        package: &PackageId,
    ) -> Result<bool, BackqError> {
        Ok(self
            .check_all_tasks_completion(keys, package)
            .await?
            .is_completed())
    }

    /// Fast hint: this server's unsolved-task counter for `package` is above zero.
    ///
    /// A missing counter reads as zero.
    pub async fn check_package_liveness(
        &self,
        keys: &EventKeyNames,
        package: &PackageId,
    ) -> Result<bool, BackqError> {
        let key = keys.server_prefix.as_str();
        let Some(raw) = self.store.get_hash_field(key, package.as_str()).await? else {
            return Ok(false);
        };
        let unsolved: i64 = raw.trim().parse().map_err(|_| BackqError::MalformedCounter {
            key: key.to_string(),
            field: package.to_string(),
            value: raw.clone(),
        })?;
        Ok(unsolved > 0)
    }
}
