//! Progress - タスクの進捗 record と、その集計結果
//!
//! # 2 つの型
//! - **TaskProgress**: executor がタスクごとに書き込む record（progress hash の値、JSON）
//! - **PackageProgress**: ProgressAggregator が 1 回の snapshot から計算する集計
//!
//! `completedPercent == -1` は「まだ始まっていない」を表す sentinel です。

use serde::{Deserialize, Serialize};

/// 未開始を表す `completed_percent` の値
pub const NOT_STARTED: i32 = -1;

/// 1 タスクの進捗（package の progress key の下に JSON で保存される）
///
/// wire 上のフィールド名は camelCase（`completedPercent`, `isRunning`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    /// executor が拾うまでは `-1`、その後は 0..=100
    pub completed_percent: i32,
    pub is_running: bool,
}

impl TaskProgress {
    /// 未開始の record（executor が最初に書き込む）
    pub fn not_started() -> Self {
        Self {
            completed_percent: NOT_STARTED,
            is_running: false,
        }
    }

    /// 実行中の record
    pub fn running(completed_percent: i32) -> Self {
        Self {
            completed_percent,
            is_running: true,
        }
    }

    /// 完了した record（100%、not-running）
    pub fn finished() -> Self {
        Self {
            completed_percent: 100,
            is_running: false,
        }
    }

    /// sentinel でなければ開始済み
    pub fn is_started(&self) -> bool {
        self.completed_percent >= 0
    }
}

/// 1 回の snapshot から計算したパッケージ全体の集計
///
/// 走査は最初の未開始 record で打ち切るので、`any_running` はそれまでに見た
/// record だけを反映します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackageProgress {
    pub task_count: usize,
    pub any_running: bool,
    pub not_started: bool,
    /// `completed_percent` の平均（切り捨て）。打ち切った場合と空の snapshot では `None`
    pub percent: Option<i32>,
}

impl PackageProgress {
    /// 全 record が not-running で、sentinel が 1 つもない
    ///
    /// 空の snapshot は完了扱いにしない
    pub fn is_completed(&self) -> bool {
        self.task_count > 0 && !self.any_running && !self.not_started
    }
}
