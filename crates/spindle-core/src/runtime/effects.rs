//! Effects / Input - 状態機械と runtime の境界
//!
//! # 設計原則
//! - 状態機械は同期・純粋（入力を受けて Effect を積むだけ）
//! - 副作用は runtime が実行し、完了を `Input` として戻す
//! - タイマーは token 付き。古い token の `TimerFired` は状態機械側で捨てる

use std::time::Duration;

use crate::domain::activity::ActivityRecord;
use crate::domain::component::{ComponentKind, ComponentProperties, ComponentSnapshot, UiState};
use crate::domain::errors::AdminError;
use crate::domain::events::{ServiceEvent, TaskEvent};
use crate::domain::ids::{ActivityId, ComponentId, TaskId};
use crate::domain::mood::Mood;
use crate::domain::notification::{Document, NotifyRequest};
use crate::domain::worker::{WorkerInfo, WorkerName};
use crate::ports::LoadRequest;

/// Why a UI state is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiPurpose {
    /// Loaded component went happy; fetch before electing it.
    Elect,
    /// Proof of life for a held (lost) component.
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskTimer {
    Retry,
    Hold,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Task(TaskId, TaskTimer),
    /// Pending scheduler admission pass.
    Admission,
    /// Manager startup idle barrier.
    IdleBarrier(ComponentKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Load {
        task: TaskId,
        request: LoadRequest,
    },
    WaitHappy {
        task: TaskId,
        component: ComponentId,
        timeout: Duration,
    },
    FetchUiState {
        task: TaskId,
        component: ComponentId,
        purpose: UiPurpose,
        timeout: Duration,
    },
    /// Force stop then force delete, with bounded retry.
    Stop {
        task: Option<TaskId>,
        component: ComponentId,
    },
    Acknowledge {
        task: TaskId,
        component: ComponentId,
        timeout: Duration,
    },
    FetchProperties {
        component: ComponentId,
        timeout: Duration,
    },
    FetchReport {
        task: TaskId,
        component: ComponentId,
        timeout: Duration,
    },
    Schedule {
        key: TimerKey,
        token: u64,
        delay: Duration,
    },
    Cancel {
        key: TimerKey,
    },
    StoreActivity(ActivityRecord),
    DeleteActivity(ActivityId),
    Notify(NotifyRequest),
    Publish(ServiceEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    LoadFinished {
        task: TaskId,
        name: String,
        result: Result<ComponentSnapshot, AdminError>,
    },
    HappyFinished {
        task: TaskId,
        component: ComponentId,
        result: Result<(), AdminError>,
    },
    UiStateFetched {
        task: TaskId,
        component: ComponentId,
        purpose: UiPurpose,
        result: Result<UiState, AdminError>,
    },
    Stopped {
        task: Option<TaskId>,
        component: ComponentId,
        result: Result<(), AdminError>,
    },
    Acknowledged {
        task: TaskId,
        component: ComponentId,
        result: Result<(), AdminError>,
    },
    PropertiesFetched {
        component: ComponentId,
        result: Result<ComponentProperties, AdminError>,
    },
    ReportFetched {
        task: TaskId,
        component: ComponentId,
        result: Result<Document, AdminError>,
    },
    TimerFired {
        key: TimerKey,
        token: u64,
    },
    ComponentAdded(ComponentSnapshot),
    ComponentRemoved(ComponentId),
    MoodChanged {
        component: ComponentId,
        mood: Mood,
    },
    UiStateChanged {
        component: ComponentId,
        ui_state: UiState,
    },
    WorkerAdded(WorkerInfo),
    WorkerRemoved(WorkerName),
}

/// Effect buffer for one step.
#[derive(Debug, Default)]
pub struct Effects {
    items: Vec<Effect>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: Effect) {
        self.items.push(effect);
    }

    pub fn publish(&mut self, event: ServiceEvent) {
        self.items.push(Effect::Publish(event));
    }

    pub fn publish_task(&mut self, task: TaskId, label: &str, event: TaskEvent) {
        self.publish(ServiceEvent::Task {
            task,
            label: label.to_string(),
            event,
        });
    }

    pub fn schedule(&mut self, key: TimerKey, token: u64, delay: Duration) {
        self.items.push(Effect::Schedule { key, token, delay });
    }

    pub fn cancel(&mut self, key: TimerKey) {
        self.items.push(Effect::Cancel { key });
    }

    /// Position to pass to [`Effects::task_events_since`].
    pub fn mark(&self) -> usize {
        self.items.len()
    }

    /// Task events published after `mark`.
    pub fn task_events_since(&self, mark: usize) -> Vec<(TaskId, TaskEvent)> {
        self.items
            .iter()
            .skip(mark)
            .filter_map(|effect| match effect {
                Effect::Publish(ServiceEvent::Task { task, event, .. }) => {
                    Some((*task, event.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Effect> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Effect> {
        self.items.drain(..)
    }
}

impl IntoIterator for Effects {
    type Item = Effect;
    type IntoIter = std::vec::IntoIter<Effect>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// A synchronous state machine driven by [`crate::runtime::Runtime`].
pub trait Machine: Send + 'static {
    fn handle(&mut self, input: Input, fx: &mut Effects);

    /// Called once after every input or call, before effects run.
    fn settle(&mut self, _fx: &mut Effects) {}
}
