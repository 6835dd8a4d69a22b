//! Errors - エラー型
//!
//! # 分類
//! - **StoreError**: coordination store の障害（core はリトライしない、呼び出し側へ伝播）
//! - **BackqError**: core の操作が返すエラー（store 障害、壊れた record、spawner 失敗）
//!
//! `Spawn` は WorkerLoop が「そのパッケージを見捨てる」合図として扱い、ループは止めません。
//!
//! 「仕事がない」「競争に負けた」はエラーではなく、`CaptureOutcome` で表現します。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum BackqError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed progress record {key}/{field}: {source}")]
    MalformedProgress {
        key: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed unsolved-task counter {key}/{field}: {value:?}")]
    MalformedCounter {
        key: String,
        field: String,
        value: String,
    },

    #[error("failed to encode value for the store: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to spawn package {package}: {reason}")]
    Spawn { package: String, reason: String },
}
