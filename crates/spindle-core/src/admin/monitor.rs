//! MonitorTask - 受信ディレクトリを見張る monitor component のタスク
//!
//! 選出された monitor の UI state にある `pending-files` を読み、
//! 新しく見つかったファイルを `FilesDiscovered` として publish する。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::component::{ComponentKind, ComponentProperties, ComponentSnapshot};
use crate::domain::events::{IncomingFile, TaskEvent};
use crate::domain::ids::ComponentId;
use crate::domain::mood::Mood;
use crate::domain::worker::WorkerName;

use super::kind::{TaskCtx, TaskKind};

pub const DEFAULT_MONITOR_RETRIES: u32 = 3;

/// One monitored inbound directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSpec {
    pub name: String,
    pub directory: String,
    /// Preferred worker, if any.
    #[serde(default)]
    pub worker: Option<WorkerName>,
}

pub struct MonitorTask {
    spec: MonitorSpec,
    max_retries: u32,
    /// Files reported by the last UI state.
    seen: HashSet<IncomingFile>,
}

impl MonitorTask {
    pub fn new(spec: MonitorSpec, max_retries: u32) -> Self {
        Self {
            spec,
            max_retries,
            seen: HashSet::new(),
        }
    }

    pub fn spec(&self) -> &MonitorSpec {
        &self.spec
    }

    fn scan(&mut self, ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
        let Some(ui_state) = &component.ui_state else {
            return;
        };
        let Some(raw) = ui_state.value().get("pending-files") else {
            return;
        };
        let files: Vec<IncomingFile> = match serde_json::from_value(raw.clone()) {
            Ok(files) => files,
            Err(e) => {
                warn!(task = %ctx.task, component = %component.id, error = %e, "malformed pending-files");
                return;
            }
        };

        let fresh: Vec<IncomingFile> = files
            .iter()
            .filter(|f| !self.seen.contains(*f))
            .cloned()
            .collect();
        // 消えたファイルは忘れる。再び現れたら再度通知する
        self.seen = files.into_iter().collect();

        if fresh.is_empty() {
            return;
        }
        debug!(task = %ctx.task, count = fresh.len(), "pending files discovered");
        ctx.publish(TaskEvent::FilesDiscovered { files: fresh });
    }
}

impl TaskKind for MonitorTask {
    fn component_kind(&self) -> ComponentKind {
        ComponentKind::Monitor
    }

    fn properties(&self) -> ComponentProperties {
        ComponentProperties::new()
            .with("kind", "monitor")
            .with("name", self.spec.name.clone())
            .with("directory", self.spec.directory.clone())
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn is_potential(&self, component: &ComponentSnapshot) -> bool {
        component.mood == Mood::Happy
    }

    /// Prefer the target worker, otherwise any happy monitor.
    fn select_potential(
        &self,
        candidates: &[&ComponentSnapshot],
        worker: Option<&WorkerName>,
    ) -> Option<ComponentId> {
        let happy = || candidates.iter().filter(|c| self.is_potential(c));
        happy()
            .find(|c| c.runs_on(worker))
            .or_else(|| happy().next())
            .map(|c| c.id)
    }

    fn on_elected(&mut self, ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
        self.scan(ctx, component);
    }

    fn on_ui_state(&mut self, ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
        self.scan(ctx, component);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::policy::TaskTimeouts;
    use crate::domain::component::UiState;
    use crate::domain::ids::TaskId;
    use crate::runtime::Effects;
    use serde_json::json;

    fn monitor() -> MonitorTask {
        MonitorTask::new(
            MonitorSpec {
                name: "inbox".into(),
                directory: "/srv/inbox".into(),
                worker: None,
            },
            DEFAULT_MONITOR_RETRIES,
        )
    }

    fn with_files(files: serde_json::Value) -> ComponentSnapshot {
        ComponentSnapshot::new(ComponentId::generate(), "m", ComponentKind::Monitor)
            .with_mood(Mood::Happy)
            .with_ui_state(UiState::new(json!({ "pending-files": files })))
    }

    #[test]
    fn prefers_the_target_worker() {
        let m = monitor();
        let elsewhere = ComponentSnapshot::new(ComponentId::generate(), "a", ComponentKind::Monitor)
            .on_worker(WorkerName::new("w2"))
            .with_mood(Mood::Happy);
        let local = ComponentSnapshot::new(ComponentId::generate(), "b", ComponentKind::Monitor)
            .on_worker(WorkerName::new("w1"))
            .with_mood(Mood::Happy);
        let candidates = [&elsewhere, &local];

        assert_eq!(
            m.select_potential(&candidates, Some(&WorkerName::new("w1"))),
            Some(local.id)
        );
        assert_eq!(
            m.select_potential(&candidates, Some(&WorkerName::new("w9"))),
            Some(elsewhere.id)
        );
    }

    #[test]
    fn publishes_only_new_files() {
        let mut m = monitor();
        let timeouts = TaskTimeouts::default();
        let mut fx = Effects::new();
        let task = TaskId::generate();
        let a = json!({ "customer": "acme", "profile": "hd", "file": "a.mov" });
        let b = json!({ "customer": "acme", "profile": "hd", "file": "b.mov" });

        let mut ctx = TaskCtx::new(task, "inbox", &timeouts, &mut fx);
        m.on_elected(&mut ctx, &with_files(json!([a.clone()])));
        m.on_ui_state(&mut ctx, &with_files(json!([a.clone(), b.clone()])));
        m.on_ui_state(&mut ctx, &with_files(json!([a.clone(), b.clone()])));

        let discovered: Vec<Vec<IncomingFile>> = fx
            .task_events_since(0)
            .into_iter()
            .filter_map(|(_, e)| match e {
                TaskEvent::FilesDiscovered { files } => Some(files),
                _ => None,
            })
            .collect();
        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[0][0].file, "a.mov");
        assert_eq!(discovered[1].len(), 1);
        assert_eq!(discovered[1][0].file, "b.mov");
    }
}
