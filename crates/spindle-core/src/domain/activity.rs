//! Activity records.
//!
//! One typed record per activity kind. The admin creates them when work starts,
//! mutates them on state transitions and asks the `ActivityStore` to persist or
//! drop them; the schema of the store itself is not our concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ActivityId;
use super::notification::{NotificationKind, NotifyTrigger};
use super::profile::ProfileKey;
use super::worker::WorkerName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Started,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodingActivity {
    pub id: ActivityId,
    pub label: String,
    pub profile: ProfileKey,
    pub state: ActivityState,
    pub worker: Option<WorkerName>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationActivity {
    pub id: ActivityId,
    pub label: String,
    pub trigger: NotifyTrigger,
    pub kind: NotificationKind,
    pub state: ActivityState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "activity", rename_all = "snake_case")]
pub enum ActivityRecord {
    Transcoding(TranscodingActivity),
    Notification(NotificationActivity),
}

impl ActivityRecord {
    pub fn id(&self) -> ActivityId {
        match self {
            ActivityRecord::Transcoding(a) => a.id,
            ActivityRecord::Notification(a) => a.id,
        }
    }

    pub fn state(&self) -> ActivityState {
        match self {
            ActivityRecord::Transcoding(a) => a.state,
            ActivityRecord::Notification(a) => a.state,
        }
    }
}

impl TranscodingActivity {
    pub fn new(id: ActivityId, label: String, profile: ProfileKey, now: DateTime<Utc>) -> Self {
        Self {
            id,
            label,
            profile,
            state: ActivityState::Started,
            worker: None,
            started_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.state = ActivityState::Done;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.state = ActivityState::Failed;
        self.error = Some(error.into());
        self.updated_at = now;
    }
}
