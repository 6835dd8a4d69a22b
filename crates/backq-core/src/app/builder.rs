//! AppBuilder - back-server の構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - store と spawner が設定されていること
//! - key 名が空でないこと
//! - dice-roll と process plan に使う値が 0 でないこと
//!
//! ServerId は起動時に 1 回だけ生成し、未完了カウンタの key 名に埋め込みます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::capture::CaptureLoop;
use super::worker_loop::{WorkerLoop, WorkerReport};
use crate::domain::{BackqError, ConstantKey, ConstantsSet, EventKeyNames, PackageId, ServerId};
use crate::ports::{CoordinationStore, IdGenerator, PackageSpawner, SystemClock, UlidGenerator};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .store(store)
///     .spawner(spawner)
///     .constants_feed(reloader.subscribe())
///     .build()?;
/// app.run(cancel).await?;
/// ```
pub struct AppBuilder {
    store: Option<Arc<dyn CoordinationStore>>,
    spawner: Option<Arc<dyn PackageSpawner>>,
    id_generator: Box<dyn IdGenerator>,
    keys: EventKeyNames,
    constants: Option<watch::Receiver<Arc<ConstantsSet>>>,
    poll_interval: Duration,
    capture: Option<CaptureLoop>,
    completions: Option<mpsc::UnboundedSender<PackageId>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("coordination store is not configured")]
    MissingStore,

    #[error("package spawner is not configured")]
    MissingSpawner,

    #[error("key name `{0}` must not be empty")]
    EmptyKeyName(&'static str),

    #[error("constant {0} must be greater than zero")]
    ZeroConstant(ConstantKey),

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
}

impl AppBuilder {
    /// 新しい AppBuilder を作成
    ///
    /// ServerId は `UlidGenerator<SystemClock>`、key 名は `EventKeyNames::default()`、
    /// poll 間隔は 500ms で始まります。
    pub fn new() -> Self {
        Self {
            store: None,
            spawner: None,
            id_generator: Box::new(UlidGenerator::new(SystemClock)),
            keys: EventKeyNames::default(),
            constants: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            capture: None,
            completions: None,
        }
    }

    /// coordination store を設定（必須）
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// パッケージを実行側へ渡す spawner を設定（必須）
    pub fn spawner(mut self, spawner: Arc<dyn PackageSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// ServerId の生成方法を差し替え（テストで timestamp を固定するときなど）
    pub fn id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Box::new(id_generator);
        self
    }

    /// key 名を設定
    ///
    /// `server_prefix` には build 時に `:{server_id}` が付きます。
    pub fn keys(mut self, keys: EventKeyNames) -> Self {
        self.keys = keys;
        self
    }

    /// 固定のチューニング値を設定（hot-update なし）
    ///
    /// # Example
    /// ```ignore
    /// builder.constants(ConstantsSet { random_range_extended: 50, ..Default::default() });
    /// ```
    pub fn constants(mut self, constants: ConstantsSet) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(constants));
        self.constants = Some(rx);
        self
    }

    /// `ConstantsReloader` が配布するチューニング値を購読
    ///
    /// 1 プロセスに reloader は 1 つ。全 back-server に同じ receiver の clone を渡します。
    pub fn constants_feed(mut self, rx: watch::Receiver<Arc<ConstantsSet>>) -> Self {
        self.constants = Some(rx);
        self
    }

    /// 捕獲したパッケージの進捗を確認する間隔
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// CaptureLoop を差し替え（乱数の seed を固定したいとき）
    pub fn capture(mut self, capture: CaptureLoop) -> Self {
        self.capture = Some(capture);
        self
    }

    /// 完了したパッケージの通知先を設定
    pub fn completions(mut self, tx: mpsc::UnboundedSender<PackageId>) -> Self {
        self.completions = Some(tx);
        self
    }

    /// 検証してから App を生成
    ///
    /// # 検証
    /// - store / spawner が設定されている
    /// - pool_key / server_prefix が空でない
    /// - poll 間隔と dice-roll・process plan 用の定数が 0 でない
    pub fn build(self) -> Result<App, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let spawner = self.spawner.ok_or(BuildError::MissingSpawner)?;

        if self.keys.pool_key.is_empty() {
            return Err(BuildError::EmptyKeyName("pool_key"));
        }
        if self.keys.server_prefix.is_empty() {
            return Err(BuildError::EmptyKeyName("server_prefix"));
        }
        if self.poll_interval.is_zero() {
            return Err(BuildError::ZeroPollInterval);
        }

        let constants = match self.constants {
            Some(rx) => rx,
            None => watch::channel(Arc::new(ConstantsSet::default())).1,
        };
        {
            let current = constants.borrow();
            for key in [
                ConstantKey::RandomRangeExtended,
                ConstantKey::BalanceOfTasksAndProcesses,
                ConstantKey::MaxProcessesCountOnServer,
            ] {
                if current.get(key) == 0 {
                    return Err(BuildError::ZeroConstant(key));
                }
            }
        }

        let server_id = self.id_generator.generate_server_id();
        let keys = self.keys.for_server(server_id);

        let mut worker = WorkerLoop::new(store, spawner, keys, constants, self.poll_interval);
        if let Some(capture) = self.capture {
            worker = worker.with_capture(capture);
        }
        if let Some(tx) = self.completions {
            worker = worker.with_completions(tx);
        }

        Ok(App { server_id, worker })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One back-server: its identity plus the loop that serves it.
pub struct App {
    pub server_id: ServerId,
    pub worker: WorkerLoop,
}

impl App {
    /// WorkerLoop を `cancel` まで回す
    pub async fn run(self, cancel: CancellationToken) -> Result<WorkerReport, BackqError> {
        info!(server_id = %self.server_id, "back-server starting");
        self.worker.run(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{EmulatedSpawner, InMemoryCoordinationStore};
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    fn store() -> Arc<InMemoryCoordinationStore> {
        Arc::new(InMemoryCoordinationStore::new())
    }

    fn complete_builder() -> AppBuilder {
        let store = store();
        let spawner = Arc::new(EmulatedSpawner::new(store.clone(), CancellationToken::new()));
        AppBuilder::new().store(store).spawner(spawner)
    }

    #[test]
    fn test_build_success_embeds_server_id_in_counter_key() {
        let app = complete_builder().build().unwrap();
        let expected = format!("back-server:{}", app.server_id);
        assert_eq!(app.worker.keys().server_prefix, expected);
        assert_eq!(
            app.worker.keys().pool_key,
            EventKeyNames::default().pool_key
        );
    }

    #[test]
    fn test_build_uses_injected_id_generator() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let app = complete_builder()
            .id_generator(UlidGenerator::new(clock))
            .build()
            .unwrap();
        assert_eq!(
            app.server_id.as_ulid().timestamp_ms(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .unwrap()
                .timestamp_millis() as u64
        );
    }

    #[test]
    fn test_build_missing_store() {
        let spawner = Arc::new(EmulatedSpawner::new(store(), CancellationToken::new()));
        let err = AppBuilder::new().spawner(spawner).build().err();
        assert_eq!(err, Some(BuildError::MissingStore));
    }

    #[test]
    fn test_build_missing_spawner() {
        let err = AppBuilder::new().store(store()).build().err();
        assert_eq!(err, Some(BuildError::MissingSpawner));
    }

    #[test]
    fn test_build_empty_pool_key() {
        let err = complete_builder()
            .keys(EventKeyNames {
                pool_key: String::new(),
                ..EventKeyNames::default()
            })
            .build()
            .err();
        assert_eq!(err, Some(BuildError::EmptyKeyName("pool_key")));
    }

    #[test]
    fn test_build_zero_poll_interval() {
        let err = complete_builder().poll_interval(Duration::ZERO).build().err();
        assert_eq!(err, Some(BuildError::ZeroPollInterval));
    }

    #[rstest]
    #[case::dice(ConstantKey::RandomRangeExtended)]
    #[case::balance(ConstantKey::BalanceOfTasksAndProcesses)]
    #[case::ceiling(ConstantKey::MaxProcessesCountOnServer)]
    fn test_build_rejects_zero_constant(#[case] key: ConstantKey) {
        let mut constants = ConstantsSet::default();
        constants.apply(key, 0);
        let err = complete_builder().constants(constants).build().err();
        assert_eq!(err, Some(BuildError::ZeroConstant(key)));
    }
}
