//! State - タスク・ジョブ・マネージャーの状態
//!
//! # 状態遷移（Admin Task）
//! - stopped → starting → started
//! - starting → stopped（startup 失敗）
//! - started → pausing → paused
//! - paused → resuming → started / paused（resume 失敗）
//! - started | paused | resuming | starting → terminating → terminated（stop）
//! - * → terminated（abort）

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskState は Admin Task のライフサイクル
///
/// 遷移は `can_transition_to` で検査し、違反は StateConflict エラーになる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Stopped,
    Starting,
    Started,
    Pausing,
    Paused,
    Resuming,
    Terminating,
    Terminated,
}

impl TaskState {
    /// Is `self -> next` a legal lifecycle step?
    ///
    /// `abort()` bypasses this check; it may reach `Terminated` from anywhere.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Paused)
                | (Starting, Stopped)
                | (Started, Pausing)
                | (Pausing, Paused)
                | (Paused, Resuming)
                | (Resuming, Started)
                | (Resuming, Paused)
                | (Started | Paused | Resuming | Starting, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Terminating | TaskState::Terminated)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Stopped => "stopped",
            TaskState::Starting => "starting",
            TaskState::Started => "started",
            TaskState::Pausing => "pausing",
            TaskState::Paused => "paused",
            TaskState::Resuming => "resuming",
            TaskState::Terminating => "terminating",
            TaskState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// JobState は変換ジョブのサブプロトコル
///
/// - pending: 実行中（または開始待ち）
/// - waiting_ack: transcoder が終了を報告し、acknowledge 待ち
/// - terminated: acknowledge 済み。結果は確定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    WaitingAck,
    Terminated,
}

/// ManagerState は Task Manager 全体の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Stopped,
    Starting,
    Started,
    Paused,
    Aborted,
}
