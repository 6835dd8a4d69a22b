//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（coordination store、タスク実行側、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - store が唯一の共有状態（プロセス内の共有可変状態は持たない）
//! - 排他は store の原子的な field 削除のみ
//! - タスクの起動と進捗計算は外部の責務

pub mod clock;
pub mod coordination_store;
pub mod id_generator;
pub mod spawner;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::coordination_store::{CoordinationStore, KeySubscription};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::spawner::PackageSpawner;
