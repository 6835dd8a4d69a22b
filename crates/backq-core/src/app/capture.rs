//! CaptureLoop - タスクパッケージの捕獲プロトコル
//!
//! # フロー
//! 1. Checking: pool key が存在するか（なければ NoWork）
//! 2. Selecting: snapshot を読み、空なら NoWork、1 件ならそれ、複数ならサイコロで選ぶ
//! 3. Claiming: 選んだ field を原子的に削除（成功 → Claimed、失敗 → Retry）
//! 4. Retry: Checking に戻る
//!
//! ロックは取りません。同じ field を複数の server が狙っても、
//! `remove_hash_field` が true を返すのは 1 回だけです。
//! 負けるたびに pool は縮むか消えるので、ループは必ず NoWork か Claimed で終わります。

use std::future::Future;
use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::arbiter::select_index;
use crate::domain::{
    BackqError, CapturedPackage, ConstantsSet, EventKeyNames, PackageId, StoreError,
};
use crate::ports::CoordinationStore;

/// How one capture attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// This server now owns the package.
    Captured(CapturedPackage),
    /// Pool key absent or empty; wait for the next availability notification.
    NoWork,
    /// The cancellation token fired at a store round trip.
    Cancelled,
}

/// States of the capture state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Checking,
    /// Pool snapshot, ordered by field name.
    Selecting(Vec<(String, String)>),
    Claiming { field: String, payload: String },
    Retry,
    Claimed(CapturedPackage),
    NoWork,
    Cancelled,
}

impl CaptureState {
    /// Claimed / NoWork / Cancelled なら true
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureState::Claimed(_) | CaptureState::NoWork | CaptureState::Cancelled
        )
    }
}

pub struct CaptureLoop {
    store: Arc<dyn CoordinationStore>,
    rng: Mutex<StdRng>,
}

impl CaptureLoop {
    /// 新しい CaptureLoop を作成（乱数は entropy から seed）
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_rng(store, StdRng::from_entropy())
    }

    /// seed を固定した乱数で作成（テスト用）
    pub fn with_rng(store: Arc<dyn CoordinationStore>, rng: StdRng) -> Self {
        Self {
            store,
            rng: Mutex::new(rng),
        }
    }

    /// Run the state machine until it reaches a terminal state.
    pub async fn attempt(
        &self,
        keys: &EventKeyNames,
        constants: &ConstantsSet,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome, BackqError> {
        debug!(pool_key = %keys.pool_key, "capture attempt started");

        let mut state = CaptureState::Checking;
        let mut rounds = 0u32;
        loop {
            state = match self.step(state, keys, constants, cancel).await? {
                CaptureState::Claimed(package) => {
                    info!(package = %package.id, rounds, "task package captured");
                    return Ok(CaptureOutcome::Captured(package));
                }
                CaptureState::NoWork => {
                    debug!(rounds, "no package to capture, back to waiting");
                    return Ok(CaptureOutcome::NoWork);
                }
                CaptureState::Cancelled => return Ok(CaptureOutcome::Cancelled),
                CaptureState::Retry => {
                    rounds += 1;
                    CaptureState::Checking
                }
                next => next,
            };
        }
    }

    /// One transition.
    pub async fn step(
        &self,
        state: CaptureState,
        keys: &EventKeyNames,
        constants: &ConstantsSet,
        cancel: &CancellationToken,
    ) -> Result<CaptureState, BackqError> {
        let pool_key = keys.pool_key.as_str();
        let next = match state {
            CaptureState::Checking => {
                let Some(exists) = guarded(cancel, self.store.key_exists(pool_key)).await? else {
                    return Ok(CaptureState::Cancelled);
                };
                debug!(pool_key, exists, "pool key checked");
                if !exists {
                    return Ok(CaptureState::NoWork);
                }

                let Some(snapshot) =
                    guarded(cancel, self.store.get_all_hash_fields(pool_key)).await?
                else {
                    return Ok(CaptureState::Cancelled);
                };
                let mut candidates: Vec<(String, String)> = snapshot.into_iter().collect();
                candidates.sort_unstable();
                CaptureState::Selecting(candidates)
            }
            CaptureState::Selecting(mut candidates) => {
                // key が残っていて field が 0 件: 最後の 1 件を目の前で取られた直後
                if candidates.is_empty() {
                    warn!(pool_key, "pool key exists but holds no packages");
                    return Ok(CaptureState::NoWork);
                }
                // lock は同期ブロック内だけで持ち、await をまたがない
                let index = {
                    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                    select_index(candidates.len(), constants.random_range_extended, &mut *rng)
                };
                let (field, payload) = candidates.swap_remove(index);
                CaptureState::Claiming { field, payload }
            }
            CaptureState::Claiming { field, payload } => {
                let Some(removed) =
                    guarded(cancel, self.store.remove_hash_field(pool_key, &field)).await?
                else {
                    return Ok(CaptureState::Cancelled);
                };
                debug!(pool_key, field = %field, removed, "claim attempted");
                if removed {
                    CaptureState::Claimed(CapturedPackage {
                        id: PackageId::new(field),
                        payload,
                    })
                } else {
                    CaptureState::Retry
                }
            }
            CaptureState::Retry => CaptureState::Checking,
            terminal => terminal,
        };
        Ok(next)
    }
}

/// Await a store call unless `cancel` fires first (`Ok(None)`).
async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<Option<T>, BackqError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(None),
        result = call => Ok(Some(result?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryCoordinationStore;
    use std::collections::HashSet;

    fn keys() -> EventKeyNames {
        EventKeyNames {
            pool_key: "pool".to_string(),
            ..EventKeyNames::default()
        }
    }

    async fn seeded_store(fields: &[(&str, &str)]) -> Arc<InMemoryCoordinationStore> {
        let store = Arc::new(InMemoryCoordinationStore::new());
        for (field, value) in fields {
            store.set_hash_field("pool", field, value, None).await.unwrap();
        }
        store
    }

    fn capture(store: &Arc<InMemoryCoordinationStore>, seed: u64) -> CaptureLoop {
        CaptureLoop::with_rng(store.clone(), StdRng::seed_from_u64(seed))
    }

    #[tokio::test]
    async fn absent_pool_is_no_work() {
        let store = seeded_store(&[]).await;
        let outcome = capture(&store, 0)
            .attempt(&keys(), &ConstantsSet::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::NoWork);
    }

    #[tokio::test]
    async fn existing_but_empty_pool_is_no_work() {
        let store = seeded_store(&[]).await;
        store.insert_empty_key("pool").await;

        let outcome = capture(&store, 0)
            .attempt(&keys(), &ConstantsSet::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::NoWork);
    }

    #[tokio::test]
    async fn single_package_is_captured_and_removed() {
        let store = seeded_store(&[("A", "guidA")]).await;
        let outcome = capture(&store, 0)
            .attempt(&keys(), &ConstantsSet::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CaptureOutcome::Captured(CapturedPackage {
                id: PackageId::new("A"),
                payload: "guidA".to_string(),
            })
        );
        assert!(!store.key_exists("pool").await.unwrap());
    }

    #[tokio::test]
    async fn success_removes_exactly_one_field() {
        let store = seeded_store(&[("A", "guidA"), ("B", "guidB"), ("C", "guidC")]).await;
        let outcome = capture(&store, 9)
            .attempt(&keys(), &ConstantsSet::default(), &CancellationToken::new())
            .await
            .unwrap();

        let CaptureOutcome::Captured(package) = outcome else {
            panic!("expected a capture, got {outcome:?}");
        };
        let left = store.get_all_hash_fields("pool").await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(!left.contains_key(package.id.as_str()));
    }

    #[tokio::test]
    async fn state_machine_walks_checking_selecting_claiming() {
        let store = seeded_store(&[("A", "guidA"), ("B", "guidB")]).await;
        let capture = capture(&store, 5);
        let (keys, constants, cancel) = (keys(), ConstantsSet::default(), CancellationToken::new());

        let state = capture
            .step(CaptureState::Checking, &keys, &constants, &cancel)
            .await
            .unwrap();
        assert_eq!(
            state,
            CaptureState::Selecting(vec![
                ("A".to_string(), "guidA".to_string()),
                ("B".to_string(), "guidB".to_string()),
            ])
        );

        // 2 候補なら modulo 1 で必ず先頭
        let state = capture.step(state, &keys, &constants, &cancel).await.unwrap();
        assert_eq!(
            state,
            CaptureState::Claiming {
                field: "A".to_string(),
                payload: "guidA".to_string(),
            }
        );

        // 他の server に先を越された
        assert!(store.remove_hash_field("pool", "A").await.unwrap());
        let state = capture.step(state, &keys, &constants, &cancel).await.unwrap();
        assert_eq!(state, CaptureState::Retry);

        let state = capture.step(state, &keys, &constants, &cancel).await.unwrap();
        assert_eq!(state, CaptureState::Checking);
    }

    #[tokio::test]
    async fn loser_retries_and_claims_the_remaining_package() {
        let store = seeded_store(&[("A", "guidA"), ("B", "guidB")]).await;
        let (keys, constants, cancel) = (keys(), ConstantsSet::default(), CancellationToken::new());

        // worker 1 と worker 2 が同じ snapshot を見て、同じ field を選ぶ
        let worker1 = capture(&store, 1);
        let worker2 = capture(&store, 2);
        let snap1 = worker1
            .step(CaptureState::Checking, &keys, &constants, &cancel)
            .await
            .unwrap();
        let snap2 = worker2
            .step(CaptureState::Checking, &keys, &constants, &cancel)
            .await
            .unwrap();
        let claim1 = worker1.step(snap1, &keys, &constants, &cancel).await.unwrap();
        let claim2 = worker2.step(snap2, &keys, &constants, &cancel).await.unwrap();
        assert_eq!(claim1, claim2);

        let won = worker1.step(claim1, &keys, &constants, &cancel).await.unwrap();
        assert!(matches!(won, CaptureState::Claimed(ref p) if p.id.as_str() == "A"));
        let lost = worker2.step(claim2, &keys, &constants, &cancel).await.unwrap();
        assert_eq!(lost, CaptureState::Retry);

        // 負けた側はやり直して残りを取る
        let outcome = worker2.attempt(&keys, &constants, &cancel).await.unwrap();
        assert!(matches!(outcome, CaptureOutcome::Captured(ref p) if p.id.as_str() == "B"));

        // pool が空になったら NoWork
        let outcome = worker1.attempt(&keys, &constants, &cancel).await.unwrap();
        assert_eq!(outcome, CaptureOutcome::NoWork);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_share_a_package() {
        let fields: Vec<(String, String)> = (0..20)
            .map(|i| (format!("pkg-{i:02}"), format!("guid-{i:02}")))
            .collect();
        let store = Arc::new(InMemoryCoordinationStore::new());
        for (field, value) in &fields {
            store.set_hash_field("pool", field, value, None).await.unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let capture = CaptureLoop::with_rng(store, StdRng::seed_from_u64(worker));
                let (keys, constants, cancel) =
                    (keys(), ConstantsSet::default(), CancellationToken::new());
                let mut won = Vec::new();
                while let CaptureOutcome::Captured(package) =
                    capture.attempt(&keys, &constants, &cancel).await.unwrap()
                {
                    won.push(package.id);
                }
                won
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), fields.len());
        assert_eq!(unique.len(), fields.len());
        assert!(!store.key_exists("pool").await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_touching_the_pool() {
        let store = seeded_store(&[("A", "guidA")]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = capture(&store, 0)
            .attempt(&keys(), &ConstantsSet::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::Cancelled);
        assert!(store.key_exists("pool").await.unwrap());
    }

    #[tokio::test]
    async fn store_fault_propagates() {
        let store = seeded_store(&[("A", "guidA")]).await;
        store.set_unavailable(true);

        let err = capture(&store, 0)
            .attempt(&keys(), &ConstantsSet::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackqError::Store(StoreError::Unavailable(_))));
    }
}
