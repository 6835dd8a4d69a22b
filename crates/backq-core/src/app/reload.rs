//! ConstantsReloader - チューニング値の hot-update
//!
//! # フロー
//! 1. update key を購読
//! 2. 設定された種類のイベントが来て、かつ gate が開いていれば 1 サイクル起動
//! 3. update key の全 field を読み、key を削除
//! 4. 既知の `ConstantKey` だけ適用（未知の名前・整数でない値はログを出して skip）
//! 5. version を上げて store に保存し、watch channel で配布
//! 6. update key の lifetime だけ待ってから gate を開け直す（キャンセルされたら即座に）
//! 7. キャンセルで停止するときは、公開していた `version_base` を store から消す
//!
//! version は 1 つでも値が適用されたときだけ上がります。全部 skip されたバッチでは
//! 保存も配布もしません。
//!
//! gate は `GateGuard` の drop で必ず開くので、エラーやキャンセルで抜けても閉じたままにはなりません。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{BackqError, ConstantKey, ConstantsSet, KeyEvent};
use crate::ports::CoordinationStore;

/// Field under `version_base` that holds the published set.
pub const CONSTANTS_FIELD: &str = "constants";

/// Single-slot gate keeping update cycles from overlapping.
#[derive(Debug)]
pub struct UpdateGate {
    open: AtomicBool,
}

impl UpdateGate {
    /// 開いた状態の gate を作成
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }

    /// Close the gate, or `None` if a cycle already holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<GateGuard> {
        self.open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard {
                gate: Arc::clone(self),
            })
    }

    /// 更新サイクルが走っていなければ true
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Default for UpdateGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-opens the gate on drop.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<UpdateGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.open.store(true, Ordering::Release);
    }
}

/// Result of folding one batch of updates into a set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AppliedUpdates {
    pub applied: Vec<(ConstantKey, u32)>,
    pub skipped: Vec<String>,
}

/// Apply `name -> value` pairs to `constants`; bad entries are logged and skipped.
pub fn apply_updates<'a>(
    constants: &mut ConstantsSet,
    updates: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> AppliedUpdates {
    let mut result = AppliedUpdates::default();
    for (name, raw) in updates {
        let key = match name.parse::<ConstantKey>() {
            Ok(key) => key,
            Err(e) => {
                error!(key = name, value = raw, "{e}; constant left unchanged");
                result.skipped.push(name.to_string());
                continue;
            }
        };
        let Ok(value) = raw.trim().parse::<u32>() else {
            error!(key = name, value = raw, "constant value is not a non-negative integer; left unchanged");
            result.skipped.push(name.to_string());
            continue;
        };
        let previous = constants.get(key);
        constants.apply(key, value);
        info!(key = %key, previous, value, "constant updated");
        result.applied.push((key, value));
    }
    result
}

pub struct ConstantsReloader {
    store: Arc<dyn CoordinationStore>,
    gate: Arc<UpdateGate>,
    tx: watch::Sender<Arc<ConstantsSet>>,
}

impl ConstantsReloader {
    /// Reloader seeded with `initial`, plus a receiver that always holds the latest set.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        initial: ConstantsSet,
    ) -> (Self, watch::Receiver<Arc<ConstantsSet>>) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        let reloader = Self {
            store,
            gate: Arc::new(UpdateGate::new()),
            tx,
        };
        (reloader, rx)
    }

    /// 最新の ConstantsSet を受け取る receiver をもう 1 つ作成
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConstantsSet>> {
        self.tx.subscribe()
    }

    /// 更新サイクルの gate（テストや監視用）
    pub fn gate(&self) -> Arc<UpdateGate> {
        Arc::clone(&self.gate)
    }

    /// Store the current set under its version base key.
    pub async fn publish_initial(&self) -> Result<(), BackqError> {
        let current = self.tx.borrow().clone();
        persist(self.store.as_ref(), &current).await
    }

    /// Listen for update notifications until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BackqError> {
        let this = Arc::new(self);
        let (update_key, update_event) = {
            let current = this.tx.borrow();
            (current.update_key.name.clone(), current.update_event)
        };
        let mut events = this.store.subscribe(&update_key).await?;
        info!(key = %events.key(), "subscribed to constants update key");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(KeyEvent { kind, .. }) = event else {
                warn!(key = %update_key, "constants update subscription closed");
                break;
            };
            if kind != update_event {
                continue;
            }
            let Some(guard) = this.gate.try_acquire() else {
                debug!("constants update already in progress, event ignored");
                continue;
            };

            let this = Arc::clone(&this);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = this.run_cycle(guard, &cancel).await {
                    warn!("constants update cycle failed: {e}");
                }
            });
        }

        if cancel.is_cancelled() {
            let version_base = this.tx.borrow().version_base.name.clone();
            if this.store.remove_key(&version_base).await? {
                info!(key = %version_base, "published constants removed on shutdown");
            }
        }
        Ok(())
    }

    /// One update cycle. The gate re-opens when `_guard` drops, on every exit path.
    pub async fn run_cycle(
        &self,
        _guard: GateGuard,
        cancel: &CancellationToken,
    ) -> Result<AppliedUpdates, BackqError> {
        let mut constants = ConstantsSet::clone(&self.tx.borrow());
        let update_key = constants.update_key.name.clone();
        debug!(key = %update_key, "constants update cycle started");

        let updates = self.store.get_all_hash_fields(&update_key).await?;
        if !self.store.remove_key(&update_key).await? {
            warn!(key = %update_key, "constants update key was already gone");
        }
        debug!(count = updates.len(), "updated constants fetched");

        let mut sorted: Vec<(&str, &str)> = updates
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        sorted.sort_unstable();
        let result = apply_updates(&mut constants, sorted);

        if !result.applied.is_empty() {
            constants.version_number += 1;
            persist(self.store.as_ref(), &constants).await?;
            info!(
                version = constants.version_number,
                applied = result.applied.len(),
                "constants version published"
            );
            self.tx.send_replace(Arc::new(constants.clone()));
        }

        // 更新頻度の上限: lifetime だけ gate を閉じたまま待つ
        tokio::select! {
            _ = cancel.cancelled() => debug!("constants update delay cancelled"),
            _ = tokio::time::sleep(constants.update_key.lifetime()) => {}
        }
        Ok(result)
    }
}

async fn persist(store: &dyn CoordinationStore, constants: &ConstantsSet) -> Result<(), BackqError> {
    let json = serde_json::to_string(constants).map_err(BackqError::Encode)?;
    store
        .set_hash_field(
            &constants.version_base.name,
            CONSTANTS_FIELD,
            &json,
            Some(constants.version_base.lifetime()),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TimedKey;
    use crate::impls::InMemoryCoordinationStore;
    use std::time::Duration;

    fn constants(lifetime_ms: u64) -> ConstantsSet {
        ConstantsSet {
            update_key: TimedKey {
                name: "constants:update".to_string(),
                lifetime_ms,
            },
            ..ConstantsSet::default()
        }
    }

    #[test]
    fn gate_is_single_slot_and_rearms_on_drop() {
        let gate = Arc::new(UpdateGate::new());
        let guard = gate.try_acquire().unwrap();
        assert!(!gate.is_open());
        assert!(gate.try_acquire().is_none());

        drop(guard);
        assert!(gate.is_open());
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn unknown_keys_and_bad_values_are_skipped() {
        let mut set = ConstantsSet::default();
        let result = apply_updates(
            &mut set,
            [
                ("RandomRangeExtended", "500"),
                ("NoSuchConstant", "1"),
                ("MaxProcessesCountOnServer", "lots"),
                ("BalanceOfTasksAndProcesses", "3"),
            ],
        );

        assert_eq!(
            result.applied,
            vec![
                (ConstantKey::RandomRangeExtended, 500),
                (ConstantKey::BalanceOfTasksAndProcesses, 3),
            ]
        );
        assert_eq!(result.skipped, vec!["NoSuchConstant", "MaxProcessesCountOnServer"]);
        assert_eq!(set.random_range_extended, 500);
        assert_eq!(set.balance_of_tasks_and_processes, 3);
        assert_eq!(
            set.max_processes_count_on_server,
            ConstantsSet::default().max_processes_count_on_server
        );
    }

    #[tokio::test]
    async fn cycle_applies_publishes_and_rearms() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store
            .set_hash_field("constants:update", "RandomRangeExtended", "777", None)
            .await
            .unwrap();
        let (reloader, rx) = ConstantsReloader::new(store.clone(), constants(10));
        let gate = reloader.gate();

        let guard = gate.try_acquire().unwrap();
        let result = reloader
            .run_cycle(guard, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.applied, vec![(ConstantKey::RandomRangeExtended, 777)]);
        assert!(gate.is_open());
        assert!(!store.key_exists("constants:update").await.unwrap());

        let latest = rx.borrow().clone();
        assert_eq!(latest.random_range_extended, 777);
        assert_eq!(latest.version_number, 1);

        let stored = store
            .get_hash_field("constants", CONSTANTS_FIELD)
            .await
            .unwrap()
            .unwrap();
        let stored: ConstantsSet = serde_json::from_str(&stored).unwrap();
        assert_eq!(stored, *latest);
    }

    #[tokio::test]
    async fn batch_without_valid_updates_keeps_version() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        store
            .set_hash_field("constants:update", "NoSuchConstant", "5", None)
            .await
            .unwrap();
        store
            .set_hash_field("constants:update", "RandomRangeExtended", "-3", None)
            .await
            .unwrap();
        let (reloader, rx) = ConstantsReloader::new(store.clone(), constants(10));

        let guard = reloader.gate().try_acquire().unwrap();
        let result = reloader
            .run_cycle(guard, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.applied.is_empty());
        assert_eq!(result.skipped.len(), 2);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow().version_number, 0);
        // update key は消費されるが、何も公開されない
        assert!(!store.key_exists("constants:update").await.unwrap());
        assert!(!store.key_exists("constants").await.unwrap());
    }

    #[tokio::test]
    async fn each_applied_batch_bumps_version_once() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let (reloader, rx) = ConstantsReloader::new(store.clone(), constants(1));

        for value in ["10", "20"] {
            store
                .set_hash_field("constants:update", "RandomRangeExtended", value, None)
                .await
                .unwrap();
            store
                .set_hash_field("constants:update", "BalanceOfTasksAndProcesses", "4", None)
                .await
                .unwrap();
            let guard = reloader.gate().try_acquire().unwrap();
            reloader
                .run_cycle(guard, &CancellationToken::new())
                .await
                .unwrap();
        }

        assert_eq!(rx.borrow().version_number, 2);
        assert_eq!(rx.borrow().random_range_extended, 20);
    }

    #[tokio::test]
    async fn shutdown_removes_published_constants() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let (reloader, _rx) = ConstantsReloader::new(store.clone(), constants(10));
        reloader.publish_initial().await.unwrap();
        assert!(store.key_exists("constants").await.unwrap());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reloader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(!store.key_exists("constants").await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_delay_still_rearms_gate() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let (reloader, rx) = ConstantsReloader::new(store, constants(60_000));
        let gate = reloader.gate();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let guard = gate.try_acquire().unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            reloader.run_cycle(guard, &cancel),
        )
        .await
        .expect("cancelled delay must return promptly")
        .unwrap();

        assert!(result.applied.is_empty());
        assert!(gate.is_open());
        assert_eq!(rx.borrow().version_number, 0);
    }

    #[tokio::test]
    async fn failed_cycle_rearms_gate() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let (reloader, _rx) = ConstantsReloader::new(store.clone(), constants(10));
        let gate = reloader.gate();
        store.set_unavailable(true);

        let guard = gate.try_acquire().unwrap();
        let err = reloader
            .run_cycle(guard, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackqError::Store(_)));
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn run_reacts_to_update_notifications() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let (reloader, mut rx) = ConstantsReloader::new(store.clone(), constants(10));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reloader.run(cancel.clone()));

        // 購読が張られるまで待つ
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .set_hash_field("constants:update", "MaxProcessesCountOnServer", "3", None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().max_processes_count_on_server, 3);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
