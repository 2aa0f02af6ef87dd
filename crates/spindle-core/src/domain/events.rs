//! Events - ドメインイベント
//!
//! 状態機械が発行し、runtime が broadcast で配信する。
//! Observer の弱参照レジストリは使わず、受信側が明示的に subscribe する。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::component::ComponentKind;
use super::ids::{ComponentId, TaskId};
use super::profile::ProfileKey;
use super::state::{ManagerState, TaskState};

/// A file a monitor found waiting in an inbound directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncomingFile {
    pub customer: String,
    pub profile: String,
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Done,
    Failed { reason: String },
}

/// TaskEvent は Admin Task 単位のイベント
///
/// 同じタスクの `Elected` と `Relieved` は必ず交互に出る。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    StateChanged { from: TaskState, to: TaskState },
    Elected { component: ComponentId },
    Relieved { component: ComponentId },
    Retrying { attempt: u32, delay: Duration },
    /// Retries exhausted. The task stays put until a worker suggestion resets it.
    Aborted { retries: u32, reason: String },
    Held { component: ComponentId },
    Restored { component: ComponentId },
    /// `confirmed == false`: the connection was lost, it may still be running.
    ComponentGone { component: ComponentId, confirmed: bool },
    FilesDiscovered { files: Vec<IncomingFile> },
    JobFinished { component: ComponentId, outcome: JobOutcome },
}

/// SchedulerEvent は変換ジョブのライフサイクル
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    ProfileQueued {
        profile: ProfileKey,
    },
    ProfileRemoved {
        profile: ProfileKey,
    },
    TranscodingStarted {
        profile: ProfileKey,
        task: TaskId,
    },
    TranscodingFailed {
        profile: ProfileKey,
        task: TaskId,
        reason: String,
        diagnostics: Vec<String>,
    },
    TranscodingDone {
        profile: ProfileKey,
        task: TaskId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ServiceEvent {
    Task {
        task: TaskId,
        label: String,
        event: TaskEvent,
    },
    Scheduler(SchedulerEvent),
    Manager {
        kind: ComponentKind,
        state: ManagerState,
    },
}

impl From<SchedulerEvent> for ServiceEvent {
    fn from(event: SchedulerEvent) -> Self {
        ServiceEvent::Scheduler(event)
    }
}
