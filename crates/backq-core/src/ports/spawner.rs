//! PackageSpawner port - 捕獲したパッケージを実行側へ渡す
//!
//! タスクをどう起動するか（プロセス、キュー、スレッド）は core の関心外です。
//! core は「このパッケージを、この計画で動かして」と依頼するだけで、
//! 以降の進捗は store の progress record 経由で観測します。
//!
//! # 実装
//! - **EmulatedSpawner**: 進捗を書き込むだけのエミュレータ（`impls::emulated_spawner`）

use async_trait::async_trait;

use crate::domain::{BackqError, CapturedPackage, ConstantsSet, EventKeyNames, ProcessPlan};

#[async_trait]
pub trait PackageSpawner: Send + Sync {
    /// Start executing `package`. Returns once the work is handed off, not when it finishes.
    async fn spawn(
        &self,
        package: &CapturedPackage,
        plan: ProcessPlan,
        keys: &EventKeyNames,
        constants: &ConstantsSet,
    ) -> Result<(), BackqError>;
}
