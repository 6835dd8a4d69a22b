//! IdGenerator port - ID 生成の抽象化
//!
//! back-server は起動時に自分の ServerId を 1 つ生成し、
//! それを未完了カウンタのキー名に埋め込みます。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（Clock から timestamp を取る）

use crate::domain::ServerId;
use crate::ports::Clock;
use ulid::Ulid;

/// # Thread Safety
/// - `Send + Sync` を要求（builder から worker へ渡すため）
pub trait IdGenerator: Send + Sync {
    fn generate_server_id(&self) -> ServerId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    /// timestamp 部分を `clock` から取る生成器を作成
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_server_id(&self) -> ServerId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        ServerId::from(ulid)
    }
}
