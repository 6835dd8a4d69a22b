//! CoordinationStore port - hash / TTL / pub-sub を持つ key-value store
//!
//! back-server 同士の調停はすべてこの trait 越しに行います。
//! core がロックを取ることはなく、排他は `remove_hash_field` の原子性だけに依存します。
//!
//! # 実装
//! - **InMemoryCoordinationStore**: 開発・テスト用（`impls::inmem_store`）
//! - 本番用（Redis など）は別クレートに配置する想定

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{KeyEvent, StoreError};

/// Hash-typed key/value store with atomic field removal and key notifications.
///
/// # 設計原則
/// - TTL は producer が `set_hash_field` で付ける（core は管理しない）
/// - `get_all_hash_fields` は producer が書き込み中のフィールドを取りこぼしてよい
/// - `remove_hash_field` は「この呼び出しが実際に消した」ときだけ true
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn key_exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Snapshot of every field of a hash. Missing key reads as an empty map.
    async fn get_all_hash_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Write one field. `ttl` (if any) is applied to the whole key.
    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Atomic delete-if-present; true iff this call removed the field.
    async fn remove_hash_field(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Delete the whole key; true iff it existed.
    async fn remove_key(&self, key: &str) -> Result<bool, StoreError>;

    /// Receive notifications for mutations of `key`.
    async fn subscribe(&self, key: &str) -> Result<KeySubscription, StoreError>;
}

/// Stream of notifications for one key. Dropping it unsubscribes.
#[derive(Debug)]
pub struct KeySubscription {
    key: String,
    rx: mpsc::UnboundedReceiver<KeyEvent>,
}

impl KeySubscription {
    /// store 実装が購読を返すときに使う
    pub fn new(key: impl Into<String>, rx: mpsc::UnboundedReceiver<KeyEvent>) -> Self {
        Self {
            key: key.into(),
            rx,
        }
    }

    /// 購読している key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next event, or `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<KeyEvent> {
        self.rx.recv().await
    }

    /// Already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<KeyEvent> {
        self.rx.try_recv().ok()
    }
}
