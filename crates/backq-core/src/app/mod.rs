//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて back-server のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **arbiter**: 候補の中から 1 つを選ぶ dice-roll
//! - **CaptureLoop**: pool から 1 パッケージを原子的に奪う
//! - **ProgressAggregator**: 捕獲したパッケージの完了判定と liveness
//! - **ConstantsReloader**: チューニング値の hot-update
//! - **WorkerLoop**: 待機→捕獲→起動→監視の繰り返し
//! - **AppBuilder**: 構築とワイヤリング

pub mod arbiter;
pub mod builder;
pub mod capture;
pub mod progress;
pub mod reload;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::capture::{CaptureLoop, CaptureOutcome, CaptureState};
pub use self::progress::ProgressAggregator;
pub use self::reload::{AppliedUpdates, ConstantsReloader, GateGuard, UpdateGate};
pub use self::worker_loop::{WorkerLoop, WorkerReport};
