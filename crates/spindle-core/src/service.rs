//! AdminService - monitor 群と scheduler をまとめた最上位の状態機械
//!
//! # 役割
//! - monitor 用の `TaskManager<MonitorTask>` と transcoder 用の `Scheduler` を持つ
//! - 入力を component の種別・所有者・タスクで振り分ける（worker の増減は両方へ）
//! - monitor の `FilesDiscovered` をプロファイルカタログで束縛して `add_profile` する

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::admin::{AdminFuture, AdminTask, MonitorSpec, MonitorTask, TaskManager, TaskSettings};
use crate::config::AdminConfig;
use crate::domain::component::{ComponentKind, ComponentSnapshot};
use crate::domain::errors::AdminError;
use crate::domain::events::{IncomingFile, TaskEvent};
use crate::domain::ids::{ComponentId, TaskId};
use crate::domain::profile::{ProfileKey, ProfileTemplate, TranscodingParams};
use crate::ports::{Clock, IdGenerator};
use crate::runtime::{Effects, Input, Machine, TimerKey};
use crate::scheduler::{Scheduler, SchedulerCounts};

/// Profile templates keyed by (customer, profile).
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    templates: HashMap<(String, String), ProfileTemplate>,
}

impl ProfileCatalog {
    pub fn new(templates: impl IntoIterator<Item = ProfileTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| ((t.customer.clone(), t.profile.clone()), t))
                .collect(),
        }
    }

    pub fn get(&self, customer: &str, profile: &str) -> Option<&ProfileTemplate> {
        self.templates
            .get(&(customer.to_string(), profile.to_string()))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Monitors,
    Scheduler,
    Both,
    Nowhere,
}

impl Route {
    fn of_kind(kind: ComponentKind) -> Self {
        match kind {
            ComponentKind::Monitor => Route::Monitors,
            ComponentKind::Transcoder => Route::Scheduler,
        }
    }
}

pub struct AdminService {
    monitors: TaskManager<MonitorTask>,
    scheduler: Scheduler,
    catalog: ProfileCatalog,
    /// Configured monitors not yet added.
    pending_monitors: Vec<MonitorSpec>,
    task_settings: TaskSettings,
    monitor_retries: u32,
    ids: Arc<dyn IdGenerator>,
}

impl AdminService {
    pub fn new(config: &AdminConfig, ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        let task_settings = config.task_settings();
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            config.manager.clone(),
            task_settings.clone(),
            Arc::clone(&ids),
            clock,
        )
        .with_notifications(config.notifications.clone());

        Self {
            monitors: TaskManager::new(ComponentKind::Monitor, config.monitor_manager()),
            scheduler,
            catalog: ProfileCatalog::new(config.profiles.iter().cloned()),
            pending_monitors: config.monitors.clone(),
            task_settings,
            monitor_retries: config.monitor.max_retries,
            ids,
        }
    }

    pub fn monitors(&self) -> &TaskManager<MonitorTask> {
        &self.monitors
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn catalog(&self) -> &ProfileCatalog {
        &self.catalog
    }

    pub fn counts(&self) -> SchedulerCounts {
        self.scheduler.counts()
    }

    /// Nothing queued and nothing running.
    pub fn is_drained(&self) -> bool {
        self.scheduler.is_drained()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Add the configured monitors, then start both managers.
    pub fn start(&mut self, paused: bool, fx: &mut Effects) -> Result<(), AdminError> {
        for spec in std::mem::take(&mut self.pending_monitors) {
            self.add_monitor(spec, fx)?;
        }
        let mark = fx.mark();
        self.monitors.start(paused, fx)?;
        self.discover(mark, fx);
        self.scheduler.start(paused, fx)?;
        info!(
            monitors = self.monitors.task_count(),
            profiles = self.catalog.len(),
            paused,
            "admin service starting"
        );
        Ok(())
    }

    pub fn pause(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        self.monitors.pause(fx)?;
        self.scheduler.pause(fx)
    }

    pub fn resume(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        let mark = fx.mark();
        self.monitors.resume(fx)?;
        self.discover(mark, fx);
        self.scheduler.resume(fx)
    }

    pub fn abort(&mut self, fx: &mut Effects) {
        self.monitors.abort(fx);
        self.scheduler.abort(fx);
    }

    /// Resolves once both managers are started (or paused).
    pub fn wait_started(&self, timeout: Duration) -> AdminFuture<()> {
        let monitors = self.monitors.wait_started(timeout);
        let transcoders = self.scheduler.manager().wait_started(timeout);
        Box::pin(async move {
            monitors.await?;
            transcoders.await?;
            Ok(())
        })
    }

    // =========================================================================
    // Monitors and profiles
    // =========================================================================

    pub fn add_monitor(&mut self, spec: MonitorSpec, fx: &mut Effects) -> Result<TaskId, AdminError> {
        let label = format!("monitor {}", spec.name);
        let task = AdminTask::new(
            self.ids.task_id(),
            label,
            MonitorTask::new(spec, self.monitor_retries),
            self.task_settings.clone(),
            Arc::clone(&self.ids),
        );
        let mark = fx.mark();
        let id = self.monitors.add_task(task, fx)?;
        self.discover(mark, fx);
        Ok(id)
    }

    pub fn remove_monitor(&mut self, task: TaskId, fx: &mut Effects) -> Result<Vec<ComponentSnapshot>, AdminError> {
        self.monitors.remove_task(task, true, fx)
    }

    /// Queue a file by hand. Returns `false` for an unknown profile or a duplicate.
    pub fn submit(&mut self, file: &IncomingFile, input_path: &str, fx: &mut Effects) -> bool {
        let Some(template) = self.catalog.get(&file.customer, &file.profile) else {
            warn!(customer = %file.customer, profile = %file.profile, file = %file.file, "no such profile");
            return false;
        };
        let context = template.bind(&file.file);
        self.scheduler
            .add_profile(context, TranscodingParams::new(input_path), fx)
    }

    pub fn cancel(&mut self, key: &ProfileKey, fx: &mut Effects) -> bool {
        self.scheduler.remove_profile(key, fx)
    }

    /// Turn files found by monitors since `mark` into queued profiles.
    fn discover(&mut self, mark: usize, fx: &mut Effects) {
        for (task, event) in fx.task_events_since(mark) {
            let TaskEvent::FilesDiscovered { files } = event else {
                continue;
            };
            let Some(directory) = self
                .monitors
                .task(task)
                .map(|t| t.kind().spec().directory.clone())
            else {
                continue;
            };
            for file in files {
                let input = Path::new(&directory).join(&file.file);
                self.submit(&file, &input.to_string_lossy(), fx);
            }
        }
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn by_task(&self, task: TaskId) -> Route {
        if self.monitors.has_task(task) {
            Route::Monitors
        } else if self.scheduler.manager().has_task(task) {
            Route::Scheduler
        } else {
            Route::Nowhere
        }
    }

    fn by_component(&self, component: ComponentId) -> Route {
        if self.monitors.knows_component(component) {
            Route::Monitors
        } else if self.scheduler.manager().knows_component(component) {
            Route::Scheduler
        } else {
            Route::Nowhere
        }
    }

    fn route(&self, input: &Input) -> Route {
        match input {
            Input::ComponentAdded(snapshot) => Route::of_kind(snapshot.kind),
            Input::ComponentRemoved(component)
            | Input::MoodChanged { component, .. }
            | Input::UiStateChanged { component, .. }
            | Input::PropertiesFetched { component, .. } => self.by_component(*component),
            Input::LoadFinished { task, result, .. } => match (self.by_task(*task), result) {
                (Route::Nowhere, Ok(snapshot)) => Route::of_kind(snapshot.kind),
                (route, _) => route,
            },
            Input::Stopped {
                task, component, ..
            } => match task.map(|t| self.by_task(t)) {
                Some(Route::Nowhere) | None => self.by_component(*component),
                Some(route) => route,
            },
            Input::HappyFinished { task, .. }
            | Input::UiStateFetched { task, .. }
            | Input::Acknowledged { task, .. }
            | Input::TimerFired {
                key: TimerKey::Task(task, _),
                ..
            } => self.by_task(*task),
            Input::ReportFetched { .. }
            | Input::TimerFired {
                key: TimerKey::Admission,
                ..
            } => Route::Scheduler,
            Input::TimerFired {
                key: TimerKey::IdleBarrier(kind),
                ..
            } => Route::of_kind(*kind),
            Input::WorkerAdded(_) | Input::WorkerRemoved(_) => Route::Both,
        }
    }

    fn to_monitors(&mut self, input: Input, fx: &mut Effects) {
        let mark = fx.mark();
        self.monitors.handle(input, fx);
        self.discover(mark, fx);
    }
}

impl Machine for AdminService {
    fn handle(&mut self, input: Input, fx: &mut Effects) {
        match self.route(&input) {
            Route::Monitors => self.to_monitors(input, fx),
            Route::Scheduler => self.scheduler.handle(input, fx),
            Route::Both => {
                self.to_monitors(input.clone(), fx);
                self.scheduler.handle(input, fx);
            }
            Route::Nowhere => debug!(?input, "input for nobody"),
        }
    }

    fn settle(&mut self, fx: &mut Effects) {
        let mark = fx.mark();
        self.monitors.settle(fx);
        self.discover(mark, fx);
        self.scheduler.settle(fx);
    }
}
