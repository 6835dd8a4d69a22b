//! State - 捕獲したパッケージのライフサイクル
//!
//! 捕獲側（back-server）から見た状態遷移:
//! - Unclaimed → Claimed: capture loop が pool field の削除に成功
//! - Claimed → InProgress: spawner にパッケージを渡した
//! - InProgress → InProgress: progress を poll するたびに再確認
//! - InProgress → Completed: 全 record が not-running かつ sentinel なし
//! - Claimed / InProgress → Abandoned: 監視する対象がない（タスク 0 件、または
//!   progress record も未完了カウンタも見当たらない）
//!
//! Failed は存在しない。sentinel のまま止まったタスクは「まだ終わっていない」と区別できない。

use super::progress::PackageProgress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Unclaimed,
    Claimed,
    InProgress,
    Completed,
    /// Nothing left to watch; the server goes back to waiting without a completion.
    Abandoned,
}

impl PackageState {
    /// Successful claim.
    pub fn claim(self) -> Self {
        match self {
            PackageState::Unclaimed => PackageState::Claimed,
            other => other,
        }
    }

    /// Package handed to the spawner.
    pub fn start(self) -> Self {
        match self {
            PackageState::Claimed => PackageState::InProgress,
            other => other,
        }
    }

    /// Fold one aggregator poll into the state.
    pub fn observe(self, progress: &PackageProgress) -> Self {
        match self {
            PackageState::InProgress if progress.is_completed() => PackageState::Completed,
            other => other,
        }
    }

    /// Give up watching a claimed package.
    pub fn abandon(self) -> Self {
        match self {
            PackageState::Claimed | PackageState::InProgress => PackageState::Abandoned,
            other => other,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PackageState::Completed | PackageState::Abandoned)
    }
}
