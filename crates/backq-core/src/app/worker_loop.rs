//! WorkerLoop - back-server のメインループ
//!
//! # フロー
//! 1. pool key を購読（起動直後にも 1 回捕獲を試す）
//! 2. HashSet 通知が来たら CaptureLoop を実行（最新の ConstantsSet を使う）
//! 3. 捕獲できたら ProcessPlan を決めて PackageSpawner に渡す
//! 4. poll_interval ごとに liveness と progress を確認し、Completed になるまで待つ
//! 5. 完了したパッケージを通知して 1 に戻る
//!
//! # 見捨てるケース（Abandoned）
//! - payload hash が空か消えている（TTL 切れなど）: spawner に渡さず即座に待機へ戻る
//! - poll で progress record が 0 件かつ liveness カウンタも 0: 監視対象が消えたとみなす
//!
//! 集計側（ProgressAggregator）は空の snapshot を「未完了」と返すだけなので、
//! 見捨てる判断はこのループが liveness と組み合わせて行います。
//!
//! store の障害はここで握りつぶさず、`run` の呼び出し側に返します。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{CaptureLoop, CaptureOutcome};
use super::progress::ProgressAggregator;
use crate::domain::{
    BackqError, CapturedPackage, ConstantsSet, EventKeyNames, KeyEventKind, PackageId,
    PackageState, ProcessPlan,
};
use crate::ports::{CoordinationStore, PackageSpawner};

/// What one `run` did before it stopped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub captured: Vec<PackageId>,
    pub completed: Vec<PackageId>,
    /// Claimed but given up on (no tasks to watch).
    pub abandoned: Vec<PackageId>,
}

pub struct WorkerLoop {
    store: Arc<dyn CoordinationStore>,
    capture: CaptureLoop,
    aggregator: ProgressAggregator,
    spawner: Arc<dyn PackageSpawner>,
    keys: EventKeyNames,
    constants: watch::Receiver<Arc<ConstantsSet>>,
    poll_interval: Duration,
    completions: Option<mpsc::UnboundedSender<PackageId>>,
}

impl WorkerLoop {
    /// 新しい WorkerLoop を作成（CaptureLoop の乱数は entropy から）
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        spawner: Arc<dyn PackageSpawner>,
        keys: EventKeyNames,
        constants: watch::Receiver<Arc<ConstantsSet>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            capture: CaptureLoop::new(Arc::clone(&store)),
            aggregator: ProgressAggregator::new(Arc::clone(&store)),
            store,
            spawner,
            keys,
            constants,
            poll_interval,
            completions: None,
        }
    }

    /// Replace the capture loop (deterministic dice in tests).
    pub fn with_capture(mut self, capture: CaptureLoop) -> Self {
        self.capture = capture;
        self
    }

    /// Report every completed package on `tx` (e.g. to whoever cleans up its progress hash).
    pub fn with_completions(mut self, tx: mpsc::UnboundedSender<PackageId>) -> Self {
        self.completions = Some(tx);
        self
    }

    /// このサーバーが使う key 名（server_prefix には ServerId が入っている）
    pub fn keys(&self) -> &EventKeyNames {
        &self.keys
    }

    fn current_constants(&self) -> Arc<ConstantsSet> {
        Arc::clone(&self.constants.borrow())
    }

    /// Wait for packages, capture, hand off, watch to completion; repeat until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<WorkerReport, BackqError> {
        let mut report = WorkerReport::default();
        let mut events = self.store.subscribe(&self.keys.pool_key).await?;
        info!(pool_key = %events.key(), server = %self.keys.server_prefix, "back-server waiting for task packages");

        // 起動前に投入済みのパッケージがあるかもしれない
        let mut pending = true;
        loop {
            if !pending {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    None => {
                        warn!("pool subscription closed");
                        break;
                    }
                    Some(event) if event.kind != KeyEventKind::HashSet => continue,
                    Some(_) => {}
                }
            }
            pending = false;
            // 溜まった通知は 1 回の捕獲で代表させる
            while events.try_recv().is_some() {}

            let constants = self.current_constants();
            match self.capture.attempt(&self.keys, &constants, &cancel).await? {
                CaptureOutcome::Captured(package) => {
                    report.captured.push(package.id.clone());
                    match self.process(&package, &cancel).await? {
                        PackageState::Completed => {
                            report.completed.push(package.id.clone());
                            if let Some(tx) = &self.completions {
                                let _ = tx.send(package.id.clone());
                            }
                        }
                        PackageState::Abandoned => report.abandoned.push(package.id.clone()),
                        _ => {}
                    }
                    // まだ残っているかもしれないので通知を待たずにもう一度
                    pending = true;
                }
                CaptureOutcome::NoWork => {}
                CaptureOutcome::Cancelled => break,
            }
        }

        info!(
            captured = report.captured.len(),
            completed = report.completed.len(),
            abandoned = report.abandoned.len(),
            "back-server stopped"
        );
        Ok(report)
    }

    /// Hand `package` to the spawner and poll until it completes or `cancel` fires.
    ///
    /// Returns `Abandoned` without spawning when the payload holds no tasks, and
    /// when a poll finds neither progress records nor a live counter.
    pub async fn process(
        &self,
        package: &CapturedPackage,
        cancel: &CancellationToken,
    ) -> Result<PackageState, BackqError> {
        let mut state = PackageState::Unclaimed.claim();
        let constants = self.current_constants();

        let task_count = self.store.get_all_hash_fields(&package.payload).await?.len();
        if task_count == 0 {
            warn!(package = %package.id, payload = %package.payload, "task package has no tasks, abandoned");
            return Ok(state.abandon());
        }
        let plan = ProcessPlan::for_task_count(task_count, &constants);
        match self.spawner.spawn(package, plan, &self.keys, &constants).await {
            Ok(()) => {}
            // spawner が受け取れなかったパッケージは pool に戻さず見捨てる
            Err(e @ BackqError::Spawn { .. }) => {
                warn!(package = %package.id, "{e}, abandoned");
                return Ok(state.abandon());
            }
            Err(e) => return Err(e),
        }
        state = state.start();
        info!(
            package = %package.id,
            tasks = plan.task_count,
            processes = plan.processes,
            "task package handed to spawner"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(state),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let alive = self
                .aggregator
                .check_package_liveness(&self.keys, &package.id)
                .await?;
            let progress = self
                .aggregator
                .check_all_tasks_completion(&self.keys, &package.id)
                .await?;
            debug!(package = %package.id, alive, percent = ?progress.percent, "package polled");

            if progress.task_count == 0 && !alive {
                warn!(package = %package.id, "no progress records and no unsolved tasks, abandoned");
                return Ok(state.abandon());
            }

            state = state.observe(&progress);
            if state.is_terminal() {
                info!(package = %package.id, "task package completed");
                return Ok(state);
            }
        }
    }
}
