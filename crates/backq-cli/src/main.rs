//! backq デモ
//!
//! in-memory store 上で、複数の back-server がタスクパッケージを奪い合う様子を再現します。
//! 使い方: `backq-cli [config.json]`（ログは `BACKQ_LOG` / `BACKQ_LOG_FORMAT`）

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use backq_core::app::{AppBuilder, BuildError, ConstantsReloader};
use backq_core::domain::{BackqError, ConstantKey, PackageId, StoreError};
use backq_core::impls::{EmulatedSpawner, InMemoryCoordinationStore};
use backq_core::observability::{LoggerConfig, LoggerError, logger_init};
use backq_core::ports::CoordinationStore;

use crate::config::{ConfigError, DemoConfig};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Logger(#[from] LoggerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build back-server: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    Backq(#[from] BackqError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out with {completed}/{expected} packages completed")]
    Deadline { completed: usize, expected: usize },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("backq: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CliError> {
    logger_init(&LoggerConfig::from_env()?)?;
    let config = match std::env::args().nth(1) {
        Some(path) => DemoConfig::load(path)?,
        None => DemoConfig::default(),
    };

    let store = Arc::new(InMemoryCoordinationStore::new());
    let cancel = CancellationToken::new();

    // (A) 定数の配布役（全 back-server が同じ watch channel を見る）
    let (reloader, constants) = ConstantsReloader::new(store.clone(), config.constants.clone());
    reloader.publish_initial().await?;
    let reloader = tokio::spawn(reloader.run(cancel.clone()));

    // (B) back-server を起動
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<PackageId>();
    let mut servers = Vec::with_capacity(config.servers);
    for _ in 0..config.servers {
        let spawner = Arc::new(EmulatedSpawner::new(store.clone(), cancel.clone()));
        let app = AppBuilder::new()
            .store(store.clone())
            .spawner(spawner)
            .keys(config.keys.clone())
            .constants_feed(constants.clone())
            .poll_interval(Duration::from_millis(config.poll_interval_ms))
            .completions(done_tx.clone())
            .build()?;
        info!(server_id = %app.server_id, "back-server registered");
        servers.push(tokio::spawn(app.run(cancel.clone())));
    }
    drop(done_tx);
    // 購読が張られるのを待つ
    sleep(Duration::from_millis(50)).await;

    // (C) front-server の代わりにパッケージを投入
    seed_packages(store.as_ref(), &config).await?;

    // (D) 運用者による hot-update
    if let Some(delay) = config.updated_task_delay_ms {
        let update_key = &config.constants.update_key;
        store
            .set_hash_field(
                &update_key.name,
                ConstantKey::TaskEmulatorDelayTimeInMilliseconds.as_str(),
                &delay.to_string(),
                Some(update_key.lifetime()),
            )
            .await?;
    }

    // (E) 全パッケージの完了を待ち、progress hash を片付ける
    let mut completed = 0;
    let waited = tokio::time::timeout(Duration::from_millis(config.deadline_ms), async {
        while completed < config.packages {
            let Some(package) = done_rx.recv().await else {
                warn!("every back-server stopped before all packages completed");
                break;
            };
            store.remove_key(&config.keys.progress_key(&package)).await?;
            completed += 1;
            info!(package = %package, completed, total = config.packages, "package done");
        }
        Ok::<(), StoreError>(())
    })
    .await;

    // (F) 停止
    cancel.cancel();
    for server in servers {
        match server.await {
            Ok(Ok(report)) => info!(
                captured = report.captured.len(),
                completed = report.completed.len(),
                abandoned = report.abandoned.len(),
                "back-server report"
            ),
            Ok(Err(e)) => error!("back-server failed: {e}"),
            Err(e) => error!("back-server task panicked: {e}"),
        }
    }
    if let Ok(Err(e)) = reloader.await {
        error!("constants reloader failed: {e}");
    }
    info!(version = constants.borrow().version_number, "final constants version");

    match waited {
        Ok(result) => result?,
        Err(_) => {
            return Err(CliError::Deadline {
                completed,
                expected: config.packages,
            });
        }
    }
    if completed < config.packages {
        return Err(CliError::Deadline {
            completed,
            expected: config.packages,
        });
    }
    info!(packages = completed, "all task packages completed");
    Ok(())
}

async fn seed_packages(store: &dyn CoordinationStore, config: &DemoConfig) -> Result<(), StoreError> {
    let ttl = Some(Duration::from_millis(config.package_ttl_ms));
    for p in 0..config.packages {
        let package = format!("package-{p:03}");
        let payload = format!("payload:{package}");
        for t in 0..config.tasks_per_package {
            store
                .set_hash_field(&payload, &format!("task-{t:03}"), "{}", ttl)
                .await?;
        }
        store
            .set_hash_field(&config.keys.pool_key, &package, &payload, ttl)
            .await?;
        info!(package = %package, tasks = config.tasks_per_package, "task package offered");
    }
    Ok(())
}
