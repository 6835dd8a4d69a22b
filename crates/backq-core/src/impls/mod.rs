//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryCoordinationStore**: 開発用の coordination store
//! - **EmulatedSpawner**: progress を書き込むだけのタスク実行エミュレータ
//!
//! # 本番用実装
//! 本番用の実装（Redis の store、実プロセスを起動する spawner）は別クレートに配置します。

pub mod emulated_spawner;
pub mod inmem_store;

pub use self::emulated_spawner::EmulatedSpawner;
pub use self::inmem_store::InMemoryCoordinationStore;
