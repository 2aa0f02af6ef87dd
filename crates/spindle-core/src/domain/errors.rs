//! Errors - エラー型と分類
//!
//! # 分類（ErrorKind）
//! - Timeout: 時間内に解決しなかった待ち。常に回復可能（retry か abort かは呼び出し側）
//! - Rejected: 所有者に拒否された（fingerprint 不一致など）。その試行だけが終わる
//! - Orphan: 生きている worker がいない。「今は動けない」だけで致命的ではない
//! - StateConflict: 状態機械と両立しない操作。呼び出し側のバグなので即失敗
//! - ConnectionLost: 接続断。強制停止はリトライせず「もう居ない」とみなす
//! - Remote: その他のリモート呼び出し失敗

use std::time::Duration;

use thiserror::Error;

use super::ids::ComponentId;
use super::state::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    Rejected,
    Orphan,
    StateConflict,
    ConnectionLost,
    Remote,
}

/// AdminError はドメインエラー
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdminError {
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("no live worker for {0}")]
    Orphan(String),

    #[error("task '{label}' cannot go from {current} to {target}")]
    StateConflict {
        label: String,
        current: TaskState,
        target: TaskState,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("could not force deletion of {component} after {attempts} attempts: {last}")]
    ForceDeletionFailed {
        component: ComponentId,
        attempts: u32,
        last: String,
    },
}

impl AdminError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        AdminError::Timeout {
            what: what.into(),
            after,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AdminError::Timeout { .. } => ErrorKind::Timeout,
            AdminError::Rejected(_) => ErrorKind::Rejected,
            AdminError::Orphan(_) => ErrorKind::Orphan,
            AdminError::StateConflict { .. } => ErrorKind::StateConflict,
            AdminError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            AdminError::Remote(_) | AdminError::ForceDeletionFailed { .. } => ErrorKind::Remote,
        }
    }

    /// Timeout / Rejected / Orphan: the caller may try again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Rejected | ErrorKind::Orphan
        )
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind() == ErrorKind::ConnectionLost
    }
}
