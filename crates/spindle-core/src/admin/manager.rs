//! TaskManager - 同じ種別の Admin Task 群と component の振り分け
//!
//! # 責務
//! - タスクを `TaskId` で保持し、fingerprint で引けるようにする
//! - 新しい component の properties を取得し、fingerprint が一致するタスクへ渡す
//!   （一致しなければ taskless として保持、sad になったら停止）
//! - balancer を持ち、worker / タスクの増減で再計算した結果を `suggest_worker` で伝える
//! - start / pause / resume / abort をまとめて行う
//!
//! # start の流れ
//! 1. properties の取得待ちがなくなるまで待つ
//! 2. 全タスクを id 順に start
//! 3. idle barrier（全タスクが idle）を上限付きで待つ。タイムアウトは warn のみ
//! 4. started（paused 指定なら paused）

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::balancer::TaskBalancer;
use crate::domain::component::{
    ComponentKind, ComponentProperties, ComponentSnapshot, Fingerprint, UiState,
};
use crate::domain::errors::AdminError;
use crate::domain::events::ServiceEvent;
use crate::domain::ids::{ComponentId, TaskId};
use crate::domain::mood::Mood;
use crate::domain::state::{ManagerState, TaskState};
use crate::domain::worker::WorkerName;
use crate::runtime::{Effect, Effects, Input, Machine, TimerKey};
use crate::waiters::{CounterWaiter, ValueWaiter, WaitError};

use super::AdminFuture;
use super::kind::TaskKind;
use super::task::AdminTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub properties_timeout_ms: u64,
    /// Upper bound of the startup idle barrier.
    pub idle_barrier_ms: u64,
    /// Fixed per-worker capacity. `None` uses the worker's `max_tasks`.
    pub slots_per_worker: Option<usize>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            properties_timeout_ms: 10_000,
            idle_barrier_ms: 30_000,
            slots_per_worker: None,
        }
    }
}

impl ManagerSettings {
    pub fn properties_timeout(&self) -> Duration {
        Duration::from_millis(self.properties_timeout_ms)
    }

    pub fn idle_barrier(&self) -> Duration {
        Duration::from_millis(self.idle_barrier_ms)
    }
}

#[derive(Debug)]
struct StartRequest {
    paused: bool,
    /// Set once the tasks were started and the barrier armed.
    barrier: Option<u64>,
}

/// A component no task claims (yet).
#[derive(Debug)]
struct Taskless {
    snapshot: ComponentSnapshot,
    /// `None` when the properties could not be fetched.
    fingerprint: Option<Fingerprint>,
}

pub struct TaskManager<K: TaskKind> {
    kind: ComponentKind,
    settings: ManagerSettings,
    state: ManagerState,

    tasks: HashMap<TaskId, AdminTask<K>>,
    by_fingerprint: HashMap<Fingerprint, TaskId>,
    owners: HashMap<ComponentId, TaskId>,
    /// Waiting for their properties.
    unresolved: HashMap<ComponentId, ComponentSnapshot>,
    taskless: HashMap<ComponentId, Taskless>,
    taskless_stopping: HashSet<ComponentId>,

    balancer: TaskBalancer<TaskId, WorkerName>,
    starting: Option<StartRequest>,
    next_token: u64,

    pending_fetches: CounterWaiter,
    status: ValueWaiter<ManagerState>,
}

impl<K: TaskKind> TaskManager<K> {
    pub fn new(kind: ComponentKind, settings: ManagerSettings) -> Self {
        Self {
            kind,
            settings,
            state: ManagerState::Stopped,
            tasks: HashMap::new(),
            by_fingerprint: HashMap::new(),
            owners: HashMap::new(),
            unresolved: HashMap::new(),
            taskless: HashMap::new(),
            taskless_stopping: HashSet::new(),
            balancer: TaskBalancer::new(),
            starting: None,
            next_token: 0,
            pending_fetches: CounterWaiter::new(0, 0),
            status: ValueWaiter::new(ManagerState::Stopped),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_starting(&self) -> bool {
        self.starting.is_some()
    }

    pub fn has_task(&self, task: TaskId) -> bool {
        self.tasks.contains_key(&task)
    }

    pub fn task(&self, task: TaskId) -> Option<&AdminTask<K>> {
        self.tasks.get(&task)
    }

    pub fn task_mut(&mut self, task: TaskId) -> Option<&mut AdminTask<K>> {
        self.tasks.get_mut(&task)
    }

    pub fn task_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&AdminTask<K>> {
        self.by_fingerprint
            .get(fingerprint)
            .and_then(|id| self.tasks.get(id))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &AdminTask<K>> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn owner_of(&self, component: ComponentId) -> Option<TaskId> {
        self.owners.get(&component).copied()
    }

    pub fn knows_component(&self, component: ComponentId) -> bool {
        self.owners.contains_key(&component)
            || self.unresolved.contains_key(&component)
            || self.taskless.contains_key(&component)
            || self.taskless_stopping.contains(&component)
    }

    pub fn taskless(&self) -> impl Iterator<Item = &ComponentSnapshot> {
        self.taskless.values().map(|t| &t.snapshot)
    }

    /// Sum of worker capacities.
    pub fn capacity(&self) -> usize {
        self.balancer.capacity()
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.values().all(|t| t.is_idle())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Register a task. Taskless components with the same fingerprint are handed over.
    pub fn add_task(&mut self, mut task: AdminTask<K>, fx: &mut Effects) -> Result<TaskId, AdminError> {
        let id = task.id();
        if self.tasks.contains_key(&id) {
            return Err(AdminError::Rejected(format!("task {id} already registered")));
        }
        if let Some(other) = self.by_fingerprint.get(task.fingerprint()) {
            return Err(AdminError::Rejected(format!(
                "task {} has the same properties as {other}",
                task.label()
            )));
        }

        if let Err(e) = self.balancer.add_task(id, None) {
            return Err(AdminError::Rejected(e.to_string()));
        }

        let matching: Vec<ComponentId> = self
            .taskless
            .iter()
            .filter(|(id, t)| {
                !self.taskless_stopping.contains(*id)
                    && t.fingerprint.as_ref() == Some(task.fingerprint())
            })
            .map(|(id, _)| *id)
            .collect();
        for component in matching {
            if let Some(entry) = self.taskless.remove(&component) {
                debug!(task = %id, %component, "taskless component handed over");
                self.owners.insert(component, id);
                task.add_component(entry.snapshot, fx);
            }
        }

        info!(task = %id, label = task.label(), kind = %self.kind, "task added");
        self.by_fingerprint.insert(task.fingerprint().clone(), id);

        let start = match self.state {
            ManagerState::Started => Some(false),
            ManagerState::Paused => Some(true),
            ManagerState::Starting => self
                .starting
                .as_ref()
                .filter(|s| s.barrier.is_some())
                .map(|s| s.paused),
            ManagerState::Stopped | ManagerState::Aborted => None,
        };
        if let Some(paused) = start
            && let Err(e) = task.start(paused, fx)
        {
            warn!(task = %id, error = %e, "task did not start");
        }

        self.tasks.insert(id, task);
        self.rebalance(fx);
        Ok(id)
    }

    /// Stop a task. Its components become taskless, or are stopped when
    /// `stop_components` is set. Returns those components.
    pub fn remove_task(
        &mut self,
        id: TaskId,
        stop_components: bool,
        fx: &mut Effects,
    ) -> Result<Vec<ComponentSnapshot>, AdminError> {
        let mut task = self
            .tasks
            .remove(&id)
            .ok_or_else(|| AdminError::Rejected(format!("unknown task {id}")))?;
        self.by_fingerprint.remove(task.fingerprint());
        self.balancer.remove_task(&id);

        let released = match task.stop(fx) {
            Ok(components) => components,
            Err(e) => {
                warn!(task = %id, error = %e, "stop failed; aborting");
                let components: Vec<ComponentSnapshot> = task.components().cloned().collect();
                task.abort(fx);
                components
            }
        };
        self.owners.retain(|_, owner| *owner != id);

        let fingerprint = task.fingerprint().clone();
        for component in &released {
            if stop_components {
                self.stop_taskless(component.id, fx);
            } else {
                self.taskless.insert(
                    component.id,
                    Taskless {
                        snapshot: component.clone(),
                        fingerprint: Some(fingerprint.clone()),
                    },
                );
            }
        }
        info!(task = %id, released = released.len(), stop_components, "task removed");
        self.rebalance(fx);
        Ok(released)
    }

    // =========================================================================
    // Components
    // =========================================================================

    pub fn add_component(&mut self, snapshot: ComponentSnapshot, fx: &mut Effects) {
        let component = snapshot.id;
        if let Some(owner) = self.owners.get(&component).copied() {
            if let Some(task) = self.tasks.get_mut(&owner) {
                task.add_component(snapshot, fx);
            }
            return;
        }
        if self.knows_component(component) {
            return;
        }
        debug!(%component, name = %snapshot.name, "fetching properties");
        self.unresolved.insert(component, snapshot);
        self.pending_fetches.set_counter(self.unresolved.len());
        fx.push(Effect::FetchProperties {
            component,
            timeout: self.settings.properties_timeout(),
        });
    }

    pub fn remove_component(&mut self, component: ComponentId, fx: &mut Effects) {
        self.taskless.remove(&component);
        self.taskless_stopping.remove(&component);
        if self.unresolved.remove(&component).is_some() {
            self.fetch_done(fx);
        }
        if let Some(owner) = self.owners.remove(&component)
            && let Some(task) = self.tasks.get_mut(&owner)
        {
            task.remove_component(component, fx);
        }
    }

    fn on_properties(
        &mut self,
        component: ComponentId,
        result: Result<ComponentProperties, AdminError>,
        fx: &mut Effects,
    ) {
        let Some(snapshot) = self.unresolved.remove(&component) else {
            return;
        };

        let fingerprint = match result {
            Ok(properties) => Some(properties.fingerprint()),
            Err(e) => {
                warn!(%component, error = %e, "could not fetch properties; kept as taskless");
                None
            }
        };

        match fingerprint
            .as_ref()
            .and_then(|f| self.by_fingerprint.get(f).copied())
        {
            Some(owner) => {
                debug!(task = %owner, %component, "component routed by fingerprint");
                self.owners.insert(component, owner);
                if let Some(task) = self.tasks.get_mut(&owner) {
                    task.add_component(snapshot, fx);
                }
            }
            None => {
                let sad = snapshot.mood == Mood::Sad;
                debug!(%component, "component is taskless");
                self.taskless.insert(
                    component,
                    Taskless {
                        snapshot,
                        fingerprint,
                    },
                );
                if sad {
                    self.stop_taskless(component, fx);
                }
            }
        }
        self.fetch_done(fx);
    }

    fn fetch_done(&mut self, fx: &mut Effects) {
        self.pending_fetches.set_counter(self.unresolved.len());
        if self.unresolved.is_empty()
            && self
                .starting
                .as_ref()
                .is_some_and(|s| s.barrier.is_none())
        {
            self.begin_start(fx);
        }
    }

    fn on_mood(&mut self, component: ComponentId, mood: Mood, fx: &mut Effects) {
        if let Some(owner) = self.owners.get(&component).copied() {
            if let Some(task) = self.tasks.get_mut(&owner) {
                task.handle(Input::MoodChanged { component, mood }, fx);
            }
            return;
        }
        if let Some(snapshot) = self.unresolved.get_mut(&component) {
            snapshot.mood = mood;
            return;
        }
        if let Some(entry) = self.taskless.get_mut(&component) {
            entry.snapshot.mood = mood;
            if mood == Mood::Sad {
                self.stop_taskless(component, fx);
            }
        }
    }

    fn on_ui_state(&mut self, component: ComponentId, ui_state: UiState, fx: &mut Effects) {
        if let Some(owner) = self.owners.get(&component).copied() {
            if let Some(task) = self.tasks.get_mut(&owner) {
                task.handle(Input::UiStateChanged { component, ui_state }, fx);
            }
            return;
        }
        if let Some(snapshot) = self.unresolved.get_mut(&component) {
            snapshot.ui_state = Some(ui_state);
        } else if let Some(entry) = self.taskless.get_mut(&component) {
            entry.snapshot.ui_state = Some(ui_state);
        }
    }

    fn stop_taskless(&mut self, component: ComponentId, fx: &mut Effects) {
        if !self.taskless_stopping.insert(component) {
            return;
        }
        info!(%component, "stopping taskless component");
        fx.push(Effect::Stop {
            task: None,
            component,
        });
    }

    fn on_stopped(
        &mut self,
        task: Option<TaskId>,
        component: ComponentId,
        result: Result<(), AdminError>,
        fx: &mut Effects,
    ) {
        match task.and_then(|id| self.tasks.get_mut(&id)) {
            Some(owner) => {
                self.owners.remove(&component);
                owner.handle(
                    Input::Stopped {
                        task,
                        component,
                        result,
                    },
                    fx,
                );
            }
            None => {
                self.taskless_stopping.remove(&component);
                self.taskless.remove(&component);
                self.owners.remove(&component);
                match result {
                    Ok(()) => debug!(%component, "taskless component deleted"),
                    Err(e) if e.is_connection_lost() => {
                        warn!(%component, error = %e, "connection lost while stopping; it might still be running")
                    }
                    Err(e) => error!(%component, error = %e, "could not force deletion"),
                }
            }
        }
    }

    /// A load finished for `task`. Loads of vanished tasks are stopped.
    fn on_load_finished(&mut self, input: Input, fx: &mut Effects) {
        let Input::LoadFinished { task, result, .. } = &input else {
            return;
        };
        let task = *task;
        let loaded = result.as_ref().ok().map(|s| s.id);

        if !self.tasks.contains_key(&task) {
            if let Some(component) = loaded {
                debug!(%task, %component, "load finished for a removed task");
                self.stop_taskless(component, fx);
            }
            return;
        }
        if let Some(component) = loaded {
            self.owners.insert(component, task);
        }
        if let Some(owner) = self.tasks.get_mut(&task) {
            owner.handle(input, fx);
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn start(&mut self, paused: bool, fx: &mut Effects) -> Result<(), AdminError> {
        if self.starting.is_some() {
            return Err(AdminError::Rejected(format!(
                "{} manager is already starting",
                self.kind
            )));
        }
        if matches!(self.state, ManagerState::Started | ManagerState::Paused) {
            return Err(AdminError::Rejected(format!(
                "{} manager is already {:?}",
                self.kind, self.state
            )));
        }

        self.set_state(ManagerState::Starting, fx);
        self.starting = Some(StartRequest {
            paused,
            barrier: None,
        });
        if self.unresolved.is_empty() {
            self.begin_start(fx);
        } else {
            info!(kind = %self.kind, pending = self.unresolved.len(), "waiting for properties before starting");
        }
        Ok(())
    }

    fn begin_start(&mut self, fx: &mut Effects) {
        let Some(paused) = self.starting.as_ref().map(|s| s.paused) else {
            return;
        };

        let mut ids: Vec<TaskId> = self.tasks.keys().copied().collect();
        ids.sort();
        for id in ids {
            if let Some(task) = self.tasks.get_mut(&id)
                && task.state() == TaskState::Stopped
                && let Err(e) = task.start(paused, fx)
            {
                warn!(task = %id, error = %e, "task did not start");
            }
        }

        self.next_token += 1;
        let token = self.next_token;
        if let Some(starting) = self.starting.as_mut() {
            starting.barrier = Some(token);
        }
        fx.schedule(TimerKey::IdleBarrier(self.kind), token, self.settings.idle_barrier());
        self.check_barrier(fx);
    }

    fn check_barrier(&mut self, fx: &mut Effects) {
        let armed = self.starting.as_ref().is_some_and(|s| s.barrier.is_some());
        if armed && self.is_idle() {
            fx.cancel(TimerKey::IdleBarrier(self.kind));
            self.finish_start(fx);
        }
    }

    fn finish_start(&mut self, fx: &mut Effects) {
        let Some(request) = self.starting.take() else {
            return;
        };
        let state = if request.paused {
            ManagerState::Paused
        } else {
            ManagerState::Started
        };
        info!(kind = %self.kind, tasks = self.tasks.len(), "manager {state:?}");
        self.set_state(state, fx);
    }

    fn on_barrier_timeout(&mut self, token: u64, fx: &mut Effects) {
        let current = self
            .starting
            .as_ref()
            .is_some_and(|s| s.barrier == Some(token));
        if !current {
            return;
        }
        let busy = self.tasks.values().filter(|t| !t.is_idle()).count();
        warn!(kind = %self.kind, busy, timeout = ?self.settings.idle_barrier(), "idle barrier timed out; proceeding");
        self.finish_start(fx);
    }

    pub fn pause(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        if self.state != ManagerState::Started {
            return Err(AdminError::Rejected(format!(
                "{} manager cannot pause while {:?}",
                self.kind, self.state
            )));
        }
        for task in self.tasks.values_mut() {
            if task.state() == TaskState::Started
                && let Err(e) = task.pause(fx)
            {
                warn!(task = %task.id(), error = %e, "task did not pause");
            }
        }
        self.set_state(ManagerState::Paused, fx);
        Ok(())
    }

    pub fn resume(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        if self.state != ManagerState::Paused {
            return Err(AdminError::Rejected(format!(
                "{} manager cannot resume while {:?}",
                self.kind, self.state
            )));
        }
        for task in self.tasks.values_mut() {
            if task.state() == TaskState::Paused
                && let Err(e) = task.resume(fx)
            {
                warn!(task = %task.id(), error = %e, "task did not resume");
            }
        }
        self.set_state(ManagerState::Started, fx);
        Ok(())
    }

    /// Abort every task. Always succeeds.
    pub fn abort(&mut self, fx: &mut Effects) {
        if self.starting.take().is_some() {
            fx.cancel(TimerKey::IdleBarrier(self.kind));
        }
        for task in self.tasks.values_mut() {
            task.abort(fx);
        }
        self.set_state(ManagerState::Aborted, fx);
    }

    fn set_state(&mut self, state: ManagerState, fx: &mut Effects) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.status.set_value(state);
        fx.publish(ServiceEvent::Manager {
            kind: self.kind,
            state,
        });
    }

    /// Resolves once the manager is started (or paused, when started paused).
    pub fn wait_started(&self, timeout: Duration) -> AdminFuture<ManagerState> {
        let wait = self.status.wait(
            &[ManagerState::Started, ManagerState::Paused],
            &[ManagerState::Aborted],
            timeout,
        );
        let kind = self.kind;
        Box::pin(async move {
            match wait.await {
                Ok(state) => Ok(state),
                Err(WaitError::Timeout(after)) => {
                    Err(AdminError::timeout(format!("{kind} manager startup"), after))
                }
                Err(WaitError::Failed(_)) => {
                    Err(AdminError::Rejected(format!("{kind} manager aborted")))
                }
                Err(WaitError::Dropped) => {
                    Err(AdminError::Remote(format!("{kind} manager went away")))
                }
            }
        })
    }

    /// Every task idle, bounded by `timeout` as a whole.
    pub fn wait_idle(&self, timeout: Duration) -> AdminFuture<()> {
        let waits: Vec<_> = self.tasks.values().map(|t| t.wait_idle(timeout)).collect();
        let fetches = self.pending_fetches.wait(timeout);
        let kind = self.kind;
        Box::pin(async move {
            let all = async move {
                fetches.await?;
                for wait in waits {
                    wait.await?;
                }
                Ok::<(), WaitError>(())
            };
            match tokio::time::timeout(timeout, all).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(WaitError::Timeout(_))) | Err(_) => {
                    Err(AdminError::timeout(format!("{kind} tasks idle"), timeout))
                }
                Ok(Err(e)) => Err(AdminError::Remote(e.to_string())),
            }
        })
    }

    // =========================================================================
    // Workers
    // =========================================================================

    pub fn add_worker(&mut self, worker: WorkerName, max_tasks: usize, fx: &mut Effects) {
        let capacity = self.settings.slots_per_worker.unwrap_or(max_tasks);
        if let Err(e) = self.balancer.add_worker(worker.clone(), capacity) {
            warn!(%worker, error = %e, "worker not added");
            return;
        }
        info!(%worker, capacity, kind = %self.kind, "worker joined");
        self.rebalance(fx);
    }

    pub fn remove_worker(&mut self, worker: &WorkerName, fx: &mut Effects) {
        if !self.balancer.remove_worker(worker) {
            return;
        }
        info!(%worker, kind = %self.kind, "worker left");
        self.rebalance(fx);
    }

    /// Forward changed assignments as worker suggestions.
    fn rebalance(&mut self, fx: &mut Effects) {
        for assignment in self.balancer.balance() {
            let Some(task) = self.tasks.get_mut(&assignment.task) else {
                continue;
            };
            if task.worker() == assignment.worker.as_ref() {
                continue;
            }
            debug!(task = %assignment.task, worker = ?assignment.worker, "suggesting worker");
            task.suggest_worker(assignment.worker, fx);
        }
    }
}

impl<K: TaskKind> Machine for TaskManager<K> {
    fn handle(&mut self, input: Input, fx: &mut Effects) {
        match input {
            Input::ComponentAdded(snapshot) => self.add_component(snapshot, fx),
            Input::ComponentRemoved(component) => self.remove_component(component, fx),
            Input::PropertiesFetched { component, result } => {
                self.on_properties(component, result, fx)
            }
            Input::MoodChanged { component, mood } => self.on_mood(component, mood, fx),
            Input::UiStateChanged {
                component,
                ui_state,
            } => self.on_ui_state(component, ui_state, fx),
            Input::Stopped {
                task,
                component,
                result,
            } => self.on_stopped(task, component, result, fx),
            input @ Input::LoadFinished { .. } => self.on_load_finished(input, fx),
            Input::TimerFired {
                key: TimerKey::IdleBarrier(_),
                token,
            } => self.on_barrier_timeout(token, fx),
            Input::WorkerAdded(info) => self.add_worker(info.name, info.max_tasks, fx),
            Input::WorkerRemoved(name) => self.remove_worker(&name, fx),
            input => {
                let task = match &input {
                    Input::HappyFinished { task, .. }
                    | Input::UiStateFetched { task, .. }
                    | Input::Acknowledged { task, .. }
                    | Input::ReportFetched { task, .. }
                    | Input::TimerFired {
                        key: TimerKey::Task(task, _),
                        ..
                    } => Some(*task),
                    _ => None,
                };
                match task.and_then(|id| self.tasks.get_mut(&id)) {
                    Some(task) => task.handle(input, fx),
                    None => debug!(kind = %self.kind, ?input, "input for no known task"),
                }
            }
        }
    }

    fn settle(&mut self, fx: &mut Effects) {
        self.check_barrier(fx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::task::TaskSettings;
    use crate::admin::task::tests::{FakeKind, loads, task_events};
    use crate::domain::events::TaskEvent;
    use crate::ports::{SystemClock, UlidGenerator};
    use std::sync::Arc;

    fn manager() -> TaskManager<FakeKind> {
        TaskManager::new(ComponentKind::Monitor, ManagerSettings::default())
    }

    fn fake_task(name: &'static str) -> AdminTask<FakeKind> {
        AdminTask::new(
            TaskId::generate(),
            name,
            FakeKind {
                name,
                ..FakeKind::default()
            },
            TaskSettings::default(),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    fn props(name: &str) -> ComponentProperties {
        ComponentProperties::new().with("name", name)
    }

    fn component(mood: Mood) -> ComponentSnapshot {
        ComponentSnapshot::new(ComponentId::generate(), "c", ComponentKind::Monitor)
            .on_worker(WorkerName::new("w1"))
            .with_mood(mood)
    }

    fn resolve(m: &mut TaskManager<FakeKind>, c: &ComponentSnapshot, name: &str, fx: &mut Effects) {
        m.handle(
            Input::PropertiesFetched {
                component: c.id,
                result: Ok(props(name)),
            },
            fx,
        );
    }

    fn stops(fx: &Effects) -> Vec<(Option<TaskId>, ComponentId)> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Stop { task, component } => Some((*task, *component)),
                _ => None,
            })
            .collect()
    }

    fn barrier_token(fx: &Effects) -> Option<u64> {
        fx.iter().find_map(|e| match e {
            Effect::Schedule {
                key: TimerKey::IdleBarrier(_),
                token,
                ..
            } => Some(*token),
            _ => None,
        })
    }

    #[test]
    fn routes_components_by_fingerprint() {
        let mut m = manager();
        let mut fx = Effects::new();
        let id = m.add_task(fake_task("a"), &mut fx).unwrap();

        let c = component(Mood::Happy);
        m.handle(Input::ComponentAdded(c.clone()), &mut fx);
        assert!(fx.iter().any(|e| matches!(e, Effect::FetchProperties { component, .. } if *component == c.id)));
        assert!(m.knows_component(c.id));
        assert_eq!(m.owner_of(c.id), None);

        resolve(&mut m, &c, "a", &mut fx);
        assert_eq!(m.owner_of(c.id), Some(id));
        assert!(m.task(id).unwrap().has_component(c.id));
    }

    #[test]
    fn sad_taskless_component_is_stopped() {
        let mut m = manager();
        let mut fx = Effects::new();
        m.add_task(fake_task("a"), &mut fx).unwrap();

        let c = component(Mood::Happy);
        m.handle(Input::ComponentAdded(c.clone()), &mut fx);
        resolve(&mut m, &c, "nobody", &mut fx);
        assert_eq!(m.taskless().count(), 1);
        assert!(stops(&fx).is_empty());

        m.handle(
            Input::MoodChanged {
                component: c.id,
                mood: Mood::Sad,
            },
            &mut fx,
        );
        assert_eq!(stops(&fx), vec![(None, c.id)]);

        m.handle(
            Input::Stopped {
                task: None,
                component: c.id,
                result: Ok(()),
            },
            &mut fx,
        );
        assert!(!m.knows_component(c.id));
    }

    #[test]
    fn new_task_adopts_matching_taskless_components() {
        let mut m = manager();
        let mut fx = Effects::new();
        let c = component(Mood::Happy);
        m.handle(Input::ComponentAdded(c.clone()), &mut fx);
        resolve(&mut m, &c, "late", &mut fx);
        assert_eq!(m.taskless().count(), 1);

        let id = m.add_task(fake_task("late"), &mut fx).unwrap();
        assert_eq!(m.taskless().count(), 0);
        assert_eq!(m.owner_of(c.id), Some(id));
    }

    #[test]
    fn duplicate_fingerprints_are_rejected() {
        let mut m = manager();
        let mut fx = Effects::new();
        m.add_task(fake_task("a"), &mut fx).unwrap();
        let err = m.add_task(fake_task("a"), &mut fx).unwrap_err();
        assert!(matches!(err, AdminError::Rejected(_)));
        assert_eq!(m.task_count(), 1);
    }

    #[test]
    fn start_waits_for_pending_properties() {
        let mut m = manager();
        let mut fx = Effects::new();
        let id = m.add_task(fake_task("a"), &mut fx).unwrap();
        let c = component(Mood::Happy);
        m.handle(Input::ComponentAdded(c.clone()), &mut fx);

        m.start(false, &mut fx).unwrap();
        assert_eq!(m.state(), ManagerState::Starting);
        assert_eq!(m.task(id).unwrap().state(), TaskState::Stopped);

        let err = m.start(false, &mut fx).unwrap_err();
        assert!(matches!(err, AdminError::Rejected(_)));

        resolve(&mut m, &c, "a", &mut fx);
        m.settle(&mut fx);
        assert_eq!(m.state(), ManagerState::Started);
        assert_eq!(m.task(id).unwrap().active().map(|s| s.id), Some(c.id));
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::Publish(ServiceEvent::Manager {
                state: ManagerState::Started,
                ..
            })
        )));
    }

    #[test]
    fn idle_barrier_timeout_is_not_fatal() {
        let mut m = manager();
        let mut fx = Effects::new();
        let id = m.add_task(fake_task("a"), &mut fx).unwrap();
        m.add_worker(WorkerName::new("w1"), 1, &mut fx);
        assert_eq!(m.task(id).unwrap().worker(), Some(&WorkerName::new("w1")));

        let mut fx = Effects::new();
        m.start(false, &mut fx).unwrap();
        m.settle(&mut fx);
        // load 中なので idle ではない
        assert!(m.task(id).unwrap().is_loading());
        assert_eq!(m.state(), ManagerState::Starting);

        let token = barrier_token(&fx).unwrap();
        m.handle(
            Input::TimerFired {
                key: TimerKey::IdleBarrier(ComponentKind::Monitor),
                token,
            },
            &mut fx,
        );
        assert_eq!(m.state(), ManagerState::Started);
    }

    #[test]
    fn workers_are_shared_by_capacity() {
        let mut m = manager();
        let mut fx = Effects::new();
        let a = m.add_task(fake_task("a"), &mut fx).unwrap();
        let b = m.add_task(fake_task("b"), &mut fx).unwrap();

        m.handle(Input::WorkerAdded(crate::domain::WorkerInfo::new("w1", 1)), &mut fx);
        assert_eq!(m.capacity(), 1);
        let placed = [a, b]
            .iter()
            .filter(|id| m.task(**id).unwrap().worker().is_some())
            .count();
        assert_eq!(placed, 1);

        m.handle(Input::WorkerAdded(crate::domain::WorkerInfo::new("w2", 1)), &mut fx);
        assert!(m.task(a).unwrap().worker().is_some());
        assert!(m.task(b).unwrap().worker().is_some());
        assert_ne!(m.task(a).unwrap().worker(), m.task(b).unwrap().worker());
    }

    #[test]
    fn fixed_slots_override_worker_capacity() {
        let mut m: TaskManager<FakeKind> = TaskManager::new(
            ComponentKind::Monitor,
            ManagerSettings {
                slots_per_worker: Some(4),
                ..ManagerSettings::default()
            },
        );
        let mut fx = Effects::new();
        m.add_worker(WorkerName::new("w1"), 1, &mut fx);
        assert_eq!(m.capacity(), 4);
    }

    #[test]
    fn removed_task_releases_or_stops_components() {
        let mut m = manager();
        let mut fx = Effects::new();
        let a = m.add_task(fake_task("a"), &mut fx).unwrap();
        let b = m.add_task(fake_task("b"), &mut fx).unwrap();
        m.start(false, &mut fx).unwrap();

        let ca = component(Mood::Happy);
        let cb = component(Mood::Happy);
        m.handle(Input::ComponentAdded(ca.clone()), &mut fx);
        resolve(&mut m, &ca, "a", &mut fx);
        m.handle(Input::ComponentAdded(cb.clone()), &mut fx);
        resolve(&mut m, &cb, "b", &mut fx);

        let released = m.remove_task(a, false, &mut fx).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(m.taskless().count(), 1);
        assert_eq!(m.owner_of(ca.id), None);

        let mut fx = Effects::new();
        m.remove_task(b, true, &mut fx).unwrap();
        assert_eq!(stops(&fx), vec![(None, cb.id)]);
        assert!(m.remove_task(b, true, &mut fx).is_err());
    }

    #[test]
    fn load_for_removed_task_is_stopped() {
        let mut m = manager();
        let mut fx = Effects::new();
        let stale = ComponentSnapshot::new(ComponentId::generate(), "x", ComponentKind::Monitor);
        m.handle(
            Input::LoadFinished {
                task: TaskId::generate(),
                name: "x".into(),
                result: Ok(stale.clone()),
            },
            &mut fx,
        );
        assert_eq!(stops(&fx), vec![(None, stale.id)]);
    }

    fn manager_states(fx: &Effects) -> Vec<ManagerState> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Publish(ServiceEvent::Manager { state, .. }) => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pause_and_resume_reach_every_task() {
        let mut m = manager();
        let mut fx = Effects::new();
        let ids = [
            m.add_task(fake_task("a"), &mut fx).unwrap(),
            m.add_task(fake_task("b"), &mut fx).unwrap(),
        ];
        m.start(false, &mut fx).unwrap();
        assert_eq!(m.state(), ManagerState::Started);
        assert!(matches!(m.resume(&mut fx), Err(AdminError::Rejected(_))));

        let mut fx = Effects::new();
        m.pause(&mut fx).unwrap();
        assert_eq!(m.state(), ManagerState::Paused);
        for id in ids {
            assert_eq!(m.task(id).unwrap().state(), TaskState::Paused);
        }
        assert!(matches!(m.pause(&mut fx), Err(AdminError::Rejected(_))));

        // paused の間に worker が来ても load しない
        m.add_worker(WorkerName::new("w1"), 2, &mut fx);
        assert!(loads(&fx).is_empty());

        let mut fx = Effects::new();
        m.resume(&mut fx).unwrap();
        assert_eq!(m.state(), ManagerState::Started);
        for id in ids {
            let task = m.task(id).unwrap();
            assert_eq!(task.state(), TaskState::Started);
            assert!(task.is_loading());
        }
        assert_eq!(loads(&fx).len(), 2);
        assert_eq!(manager_states(&fx), vec![ManagerState::Started]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_terminates_every_task_and_leaves_them_idle() {
        let mut m = manager();
        let mut fx = Effects::new();
        let ids = [
            m.add_task(fake_task("a"), &mut fx).unwrap(),
            m.add_task(fake_task("b"), &mut fx).unwrap(),
        ];
        m.add_worker(WorkerName::new("w1"), 2, &mut fx);
        m.start(false, &mut fx).unwrap();
        m.settle(&mut fx);
        // 両方 load 中なので起動は完了していない
        assert_eq!(m.state(), ManagerState::Starting);
        assert!(!m.is_idle());
        let started = m.wait_started(Duration::from_secs(60));
        let idle = m.wait_idle(Duration::from_secs(60));

        let mut fx = Effects::new();
        m.abort(&mut fx);
        m.abort(&mut fx);

        assert_eq!(m.state(), ManagerState::Aborted);
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::Cancel {
                key: TimerKey::IdleBarrier(_)
            }
        )));
        for id in ids {
            assert_eq!(m.task(id).unwrap().state(), TaskState::Terminated);
        }
        let terminated = task_events(&fx)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    TaskEvent::StateChanged {
                        to: TaskState::Terminated,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(terminated, 2);
        assert_eq!(manager_states(&fx), vec![ManagerState::Aborted]);

        idle.await.unwrap();
        assert!(matches!(started.await, Err(AdminError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_started_resolves_after_start() {
        let mut m = manager();
        let mut fx = Effects::new();
        m.add_task(fake_task("a"), &mut fx).unwrap();
        let wait = m.wait_started(Duration::from_secs(5));

        m.start(true, &mut fx).unwrap();
        m.settle(&mut fx);

        assert_eq!(wait.await.unwrap(), ManagerState::Paused);
        m.wait_idle(Duration::from_secs(1)).await.unwrap();
    }
}
