//! InMemoryCoordinationStore - 開発・テスト用の coordination store
//!
//! # 実装詳細
//! - `tokio::sync::Mutex` 1 つで全キーを保護（field 削除の原子性はこのロックで保証）
//! - TTL は store の呼び出しごとに全キーを掃除して評価（期限切れは削除して Expired を通知）
//!   タイマーは持たないので、誰も store を呼ばない間は Expired も届きません
//! - 最後の field が消えたキーは削除される（Deleted を通知）
//! - 購読者ごとに `mpsc::UnboundedSender` を持ち、送信に失敗したら購読解除とみなす

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::domain::{KeyEvent, KeyEventKind, StoreError};
use crate::ports::{CoordinationStore, KeySubscription};

#[derive(Debug, Default)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct StoreState {
    hashes: HashMap<String, HashEntry>,
    subscribers: Vec<(String, mpsc::UnboundedSender<KeyEvent>)>,
}

impl StoreState {
    /// Drop every key whose TTL ran out.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .hashes
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.hashes.remove(&key);
            self.notify(&key, KeyEventKind::Expired);
        }
    }

    fn notify(&mut self, key: &str, kind: KeyEventKind) {
        self.subscribers.retain(|(subscribed, tx)| {
            if subscribed != key {
                return !tx.is_closed();
            }
            tx.send(KeyEvent::new(key, kind)).is_ok()
        });
    }
}

pub struct InMemoryCoordinationStore {
    state: Arc<Mutex<StoreState>>,
    unavailable: AtomicBool,
}

impl InMemoryCoordinationStore {
    /// 空の store を作成
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with `StoreError::Unavailable` (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }

    /// A key that exists with zero fields, as seen between the last field's
    /// removal and the key's own deletion in a real store.
    #[cfg(test)]
    pub(crate) async fn insert_empty_key(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.hashes.entry(key.to_string()).or_default();
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.hashes.contains_key(key))
    }

    async fn get_all_hash_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state
            .hashes
            .get(key)
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state
            .hashes
            .get(key)
            .and_then(|entry| entry.fields.get(field).cloned()))
    }

    async fn set_hash_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired();
        let entry = state.hashes.entry(key.to_string()).or_default();
        entry.fields.insert(field.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        state.notify(key, KeyEventKind::HashSet);
        Ok(())
    }

    async fn remove_hash_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired();

        let Some(entry) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        if entry.fields.remove(field).is_none() {
            return Ok(false);
        }
        let drained = entry.fields.is_empty();

        state.notify(key, KeyEventKind::HashDeleted);
        if drained {
            state.hashes.remove(key);
            state.notify(key, KeyEventKind::Deleted);
        }
        Ok(true)
    }

    async fn remove_key(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_expired();
        let existed = state.hashes.remove(key).is_some();
        if existed {
            state.notify(key, KeyEventKind::Deleted);
        }
        Ok(existed)
    }

    async fn subscribe(&self, key: &str) -> Result<KeySubscription, StoreError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.subscribers.push((key.to_string(), tx));
        Ok(KeySubscription::new(key, rx))
    }
}
