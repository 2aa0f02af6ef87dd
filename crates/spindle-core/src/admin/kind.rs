//! TaskKind - 具体的なタスク種別のフック
//!
//! AdminTask は汎用の状態機械。どの component を選ぶか、選出・解任・中断の
//! ときに何をするかは TaskKind が決める。

use crate::domain::component::{ComponentKind, ComponentProperties, ComponentSnapshot};
use crate::domain::errors::AdminError;
use crate::domain::events::TaskEvent;
use crate::domain::ids::{ComponentId, TaskId};
use crate::domain::worker::WorkerName;
use crate::runtime::{Effect, Effects};

use super::policy::TaskTimeouts;

/// Hook context: who is calling and where effects go.
pub struct TaskCtx<'a> {
    pub task: TaskId,
    pub label: &'a str,
    pub timeouts: &'a TaskTimeouts,
    fx: &'a mut Effects,
}

impl<'a> TaskCtx<'a> {
    pub(crate) fn new(
        task: TaskId,
        label: &'a str,
        timeouts: &'a TaskTimeouts,
        fx: &'a mut Effects,
    ) -> Self {
        Self {
            task,
            label,
            timeouts,
            fx,
        }
    }

    pub fn publish(&mut self, event: TaskEvent) {
        self.fx.publish_task(self.task, self.label, event);
    }

    pub fn effect(&mut self, effect: Effect) {
        self.fx.push(effect);
    }
}

pub trait TaskKind: Send + 'static {
    fn component_kind(&self) -> ComponentKind;

    /// Launch properties. Their fingerprint identifies the task.
    fn properties(&self) -> ComponentProperties;

    fn max_retries(&self) -> u32 {
        0
    }

    /// Can this component continue the task's work?
    fn is_potential(&self, component: &ComponentSnapshot) -> bool;

    /// Pick a component to elect among `candidates` (sorted by id).
    ///
    /// Must be deterministic for the same input.
    fn select_potential(
        &self,
        candidates: &[&ComponentSnapshot],
        worker: Option<&WorkerName>,
    ) -> Option<ComponentId> {
        candidates
            .iter()
            .find(|c| c.runs_on(worker) && self.is_potential(c))
            .map(|c| c.id)
    }

    fn accept_suggested_worker(
        &self,
        current: Option<&WorkerName>,
        suggested: Option<&WorkerName>,
        has_active: bool,
    ) -> bool {
        current != suggested || !has_active
    }

    /// A sad elected component normally aborts the attempt.
    fn tolerates_sad(&self, _component: &ComponentSnapshot) -> bool {
        false
    }

    fn on_startup(&mut self, _ctx: &mut TaskCtx<'_>) -> Result<(), AdminError> {
        Ok(())
    }

    fn on_resume(&mut self, _ctx: &mut TaskCtx<'_>) -> Result<(), AdminError> {
        Ok(())
    }

    fn on_elected(&mut self, _ctx: &mut TaskCtx<'_>, _component: &ComponentSnapshot) {}

    fn on_relieved(&mut self, _ctx: &mut TaskCtx<'_>, _component: ComponentId) {}

    /// Retries exhausted.
    fn on_aborted(&mut self, _ctx: &mut TaskCtx<'_>, _reason: &str) {}

    /// A held component proved it is alive again.
    fn on_restored(&mut self, _ctx: &mut TaskCtx<'_>, _component: &ComponentSnapshot) {}

    /// UI state of the elected component changed.
    fn on_ui_state(&mut self, _ctx: &mut TaskCtx<'_>, _component: &ComponentSnapshot) {}

    fn on_acknowledged(
        &mut self,
        _ctx: &mut TaskCtx<'_>,
        _component: ComponentId,
        _result: Result<(), AdminError>,
    ) {
    }
}
