//! AdminTask - component の選出と再試行を行う状態機械
//!
//! # 状態遷移
//! ```text
//! stopped --start()--> starting --(startup ok)--> started
//! starting --(startup fails)--> stopped
//! started --pause()--> pausing --> paused
//! paused --resume()--> resuming --(ok)--> started
//! resuming --(fails)--> paused
//! started|paused|resuming|starting --stop()--> terminated
//! any --abort()--> terminated
//! ```
//!
//! # 選出（started の間ずっと動く）
//! 1. 候補から potential component を探す（TaskKind が決める、決定的）
//! 2. 見つかれば選出: 先に旧 component を解任し、他の候補は停止する
//! 3. 見つからなければ新しい名前で load する（pending は常に高々 1 つ）
//! 4. happy を待ち、UI state を取ってから選出。失敗したら停止して retry へ
//! 5. retry <= max_retries なら backoff 後に再 load、超えたら aborted を 1 回だけ出す
//!    Orphan（worker が居ない）で load できなかった場合は retry を消費せず、次の worker 提案を待つ
//! 6. 選出中の component が lost になったら hold。probe が通れば復帰、期限切れで retry
//! 7. paused 中に load が終わっても選出はしない。resume 時に改めて選ぶ
//!
//! 副作用はすべて `Effects` に積む。完了は `Input` として `handle` に戻ってくる。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::domain::component::{ComponentSnapshot, Fingerprint, UiState};
use crate::domain::errors::{AdminError, ErrorKind};
use crate::domain::events::TaskEvent;
use crate::domain::ids::{ComponentId, TaskId};
use crate::domain::mood::Mood;
use crate::domain::state::TaskState;
use crate::domain::worker::WorkerName;
use crate::ports::{IdGenerator, LoadRequest};
use crate::runtime::{Effect, Effects, Input, TaskTimer, TimerKey, UiPurpose};
use crate::waiters::{AssignWaiter, CounterWaiter, ValueWaiter, Wait, WaitError};

use super::AdminFuture;
use super::kind::{TaskCtx, TaskKind};
use super::policy::{RetryPolicy, TaskTimeouts};

/// Election status, observed through `wait_active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Election {
    Searching,
    Elected,
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSettings {
    pub retry: RetryPolicy,
    pub timeouts: TaskTimeouts,
}

#[derive(Debug)]
struct PendingLoad {
    name: String,
    /// Known once the loader returned.
    component: Option<ComponentId>,
}

#[derive(Debug)]
struct Hold {
    component: ComponentId,
    token: u64,
}

pub struct AdminTask<K: TaskKind> {
    id: TaskId,
    label: String,
    kind: K,
    fingerprint: Fingerprint,
    state: TaskState,
    policy: RetryPolicy,
    timeouts: TaskTimeouts,
    ids: Arc<dyn IdGenerator>,

    worker: Option<WorkerName>,
    candidates: BTreeMap<ComponentId, ComponentSnapshot>,
    active: Option<ComponentId>,
    pending: Option<PendingLoad>,
    stopping: HashSet<ComponentId>,

    retry: u32,
    exhausted: bool,
    retry_token: Option<u64>,
    hold: Option<Hold>,
    /// Worker suggestion received while holding.
    deferred_worker: Option<Option<WorkerName>>,
    next_token: u64,

    status: ValueWaiter<Election>,
    idle: CounterWaiter,
    assigned: AssignWaiter<WorkerName>,
}

impl<K: TaskKind> AdminTask<K> {
    pub fn new(
        id: TaskId,
        label: impl Into<String>,
        kind: K,
        settings: TaskSettings,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let fingerprint = kind.properties().fingerprint();
        Self {
            id,
            label: label.into(),
            kind,
            fingerprint,
            state: TaskState::Stopped,
            policy: settings.retry,
            timeouts: settings.timeouts,
            ids,
            worker: None,
            candidates: BTreeMap::new(),
            active: None,
            pending: None,
            stopping: HashSet::new(),
            retry: 0,
            exhausted: false,
            retry_token: None,
            hold: None,
            deferred_worker: None,
            next_token: 0,
            status: ValueWaiter::new(Election::Searching),
            idle: CounterWaiter::new(0, 0),
            assigned: AssignWaiter::new(None),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn worker(&self) -> Option<&WorkerName> {
        self.worker.as_ref()
    }

    pub fn active(&self) -> Option<&ComponentSnapshot> {
        self.active.and_then(|id| self.candidates.get(&id))
    }

    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_holding(&self) -> bool {
        self.hold.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// No pending load and no in-flight deletion.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.stopping.is_empty()
    }

    pub fn has_component(&self, component: ComponentId) -> bool {
        self.candidates.contains_key(&component)
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentSnapshot> {
        self.candidates.values()
    }

    pub fn wait_idle(&self, timeout: Duration) -> Wait<usize> {
        self.idle.wait(timeout)
    }

    /// Resolves once a component is elected; fails if the task aborts first.
    pub fn wait_active(&self, timeout: Duration) -> AdminFuture<()> {
        let wait = self
            .status
            .wait(&[Election::Elected], &[Election::Aborted], timeout);
        let label = self.label.clone();
        Box::pin(async move {
            match wait.await {
                Ok(_) => Ok(()),
                Err(WaitError::Timeout(after)) => {
                    Err(AdminError::timeout(format!("election of {label}"), after))
                }
                Err(WaitError::Failed(_)) => Err(AdminError::Rejected(format!("{label} aborted"))),
                Err(WaitError::Dropped) => Err(AdminError::Remote(format!("{label} went away"))),
            }
        })
    }

    /// Resolves with the worker this task loads on, once it has one.
    pub fn wait_worker(&self, timeout: Duration) -> AdminFuture<WorkerName> {
        let wait = self.assigned.wait(timeout);
        let label = self.label.clone();
        Box::pin(async move {
            wait.await.map_err(|e| match e {
                WaitError::Timeout(after) => {
                    AdminError::timeout(format!("worker for {label}"), after)
                }
                WaitError::Dropped => AdminError::Remote(format!("{label} went away")),
                WaitError::Failed(never) => match never {},
            })
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn start(&mut self, paused: bool, fx: &mut Effects) -> Result<(), AdminError> {
        self.transition(TaskState::Starting, fx)?;

        let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
        if let Err(e) = self.kind.on_startup(&mut ctx) {
            warn!(task = %self.id, error = %e, "startup failed");
            self.transition(TaskState::Stopped, fx)?;
            self.sync();
            return Err(e);
        }

        if paused {
            self.transition(TaskState::Paused, fx)?;
        } else {
            self.transition(TaskState::Started, fx)?;
            self.advance(fx);
        }
        self.sync();
        Ok(())
    }

    pub fn pause(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        self.transition(TaskState::Pausing, fx)?;
        self.cancel_retry(fx);
        self.transition(TaskState::Paused, fx)?;
        self.sync();
        Ok(())
    }

    pub fn resume(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        self.transition(TaskState::Resuming, fx)?;

        let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
        if let Err(e) = self.kind.on_resume(&mut ctx) {
            warn!(task = %self.id, error = %e, "resume failed");
            self.transition(TaskState::Paused, fx)?;
            self.sync();
            return Err(e);
        }

        self.transition(TaskState::Started, fx)?;
        self.advance(fx);
        self.sync();
        Ok(())
    }

    /// Stops managing components and hands them to the caller.
    ///
    /// Components already being deleted are not returned.
    pub fn stop(&mut self, fx: &mut Effects) -> Result<Vec<ComponentSnapshot>, AdminError> {
        self.transition(TaskState::Terminating, fx)?;
        self.relieve(fx);
        self.cancel_timers(fx);
        self.pending = None;
        self.deferred_worker = None;
        self.transition(TaskState::Terminated, fx)?;

        let released: Vec<ComponentSnapshot> = std::mem::take(&mut self.candidates)
            .into_values()
            .filter(|c| !self.stopping.contains(&c.id))
            .collect();
        self.sync();
        Ok(released)
    }

    /// Always safe, idempotent. Forgets every component.
    pub fn abort(&mut self, fx: &mut Effects) {
        if self.state == TaskState::Terminated {
            return;
        }
        self.relieve(fx);
        self.cancel_timers(fx);
        self.pending = None;
        self.deferred_worker = None;
        self.candidates.clear();
        self.stopping.clear();

        let from = self.state;
        self.state = TaskState::Terminated;
        fx.publish_task(
            self.id,
            &self.label,
            TaskEvent::StateChanged {
                from,
                to: TaskState::Terminated,
            },
        );
        info!(task = %self.id, %from, "task aborted");
        self.sync();
    }

    fn transition(&mut self, next: TaskState, fx: &mut Effects) -> Result<(), AdminError> {
        if !self.state.can_transition_to(next) {
            return Err(AdminError::StateConflict {
                label: self.label.clone(),
                current: self.state,
                target: next,
            });
        }
        let from = self.state;
        self.state = next;
        debug!(task = %self.id, %from, to = %next, "state changed");
        fx.publish_task(self.id, &self.label, TaskEvent::StateChanged { from, to: next });
        Ok(())
    }

    // =========================================================================
    // Components
    // =========================================================================

    pub fn add_component(&mut self, snapshot: ComponentSnapshot, fx: &mut Effects) {
        if self.stopping.contains(&snapshot.id) || self.state == TaskState::Terminated {
            return;
        }
        debug!(task = %self.id, component = %snapshot.id, mood = %snapshot.mood, "candidate added");
        self.candidates.insert(snapshot.id, snapshot);
        self.advance(fx);
        self.sync();
    }

    pub fn remove_component(
        &mut self,
        component: ComponentId,
        fx: &mut Effects,
    ) -> Option<ComponentSnapshot> {
        let removed = self.candidates.remove(&component);
        self.stopping.remove(&component);

        if self.pending_component() == Some(component) {
            self.pending = None;
            self.abort_attempt("loaded component vanished", fx);
        } else if self.active == Some(component) {
            self.relieve(fx);
            self.flush_deferred(fx);
            self.advance(fx);
        }
        self.sync();
        removed
    }

    /// Advise a preferred worker. Returns whether the suggestion was applied.
    pub fn suggest_worker(&mut self, worker: Option<WorkerName>, fx: &mut Effects) -> bool {
        if self.hold.is_some() {
            debug!(task = %self.id, worker = ?worker, "holding; worker suggestion deferred");
            self.deferred_worker = Some(worker);
            return false;
        }
        let accepted = self.apply_suggestion(worker, fx);
        self.sync();
        accepted
    }

    fn apply_suggestion(&mut self, worker: Option<WorkerName>, fx: &mut Effects) -> bool {
        if !self.kind.accept_suggested_worker(
            self.worker.as_ref(),
            worker.as_ref(),
            self.active.is_some(),
        ) {
            return false;
        }
        info!(task = %self.id, from = ?self.worker, to = ?worker, "worker suggestion accepted");

        let same_worker = self.worker == worker;
        self.worker = worker;
        self.cancel_retry(fx);
        self.retry = 0;
        self.exhausted = false;

        // 同じ worker への load が進行中なら、それを生かす
        if !same_worker && let Some(pending) = self.pending.take() {
            debug!(task = %self.id, component = %pending.name, "pending load cancelled");
            if let Some(component) = pending.component {
                self.stop_component(component, fx);
            }
        }

        if let Some(active) = self.active
            && self.worker.is_some()
            && !self
                .candidates
                .get(&active)
                .is_some_and(|c| c.runs_on(self.worker.as_ref()))
        {
            self.relieve(fx);
            self.stop_component(active, fx);
        }

        self.advance(fx);
        true
    }

    fn flush_deferred(&mut self, fx: &mut Effects) {
        if let Some(worker) = self.deferred_worker.take() {
            self.apply_suggestion(worker, fx);
        }
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Feed a collaborator completion or observation addressed to this task.
    pub fn handle(&mut self, input: Input, fx: &mut Effects) {
        match input {
            Input::LoadFinished { name, result, .. } => self.on_load_finished(name, result, fx),
            Input::HappyFinished {
                component, result, ..
            } => self.on_happy(component, result, fx),
            Input::UiStateFetched {
                component,
                purpose,
                result,
                ..
            } => self.on_ui_state_fetched(component, purpose, result, fx),
            Input::Stopped {
                component, result, ..
            } => self.on_stopped(component, result, fx),
            Input::Acknowledged {
                component, result, ..
            } => {
                let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
                self.kind.on_acknowledged(&mut ctx, component, result);
            }
            Input::TimerFired {
                key: TimerKey::Task(_, timer),
                token,
            } => self.on_timer(timer, token, fx),
            Input::MoodChanged { component, mood } => self.on_mood(component, mood, fx),
            Input::UiStateChanged {
                component,
                ui_state,
            } => self.on_ui_state(component, ui_state, fx),
            Input::ComponentAdded(snapshot) => self.add_component(snapshot, fx),
            Input::ComponentRemoved(component) => {
                self.remove_component(component, fx);
            }
            other => debug!(task = %self.id, input = ?other, "input ignored"),
        }
        self.sync();
    }

    fn on_load_finished(
        &mut self,
        name: String,
        result: Result<ComponentSnapshot, AdminError>,
        fx: &mut Effects,
    ) {
        let current = self
            .pending
            .as_ref()
            .is_some_and(|p| p.name == name && p.component.is_none());

        match result {
            Ok(snapshot) if !current => {
                debug!(task = %self.id, component = %name, "stale load finished; stopping it");
                let id = snapshot.id;
                self.candidates.insert(id, snapshot);
                self.stop_component(id, fx);
            }
            Err(e) if !current => {
                debug!(task = %self.id, component = %name, error = %e, "stale load failed");
            }
            Ok(snapshot) => {
                let id = snapshot.id;
                debug!(task = %self.id, component = %id, "loaded; waiting for happy");
                self.candidates.insert(id, snapshot);
                if let Some(pending) = self.pending.as_mut() {
                    pending.component = Some(id);
                }
                fx.push(Effect::WaitHappy {
                    task: self.id,
                    component: id,
                    timeout: self.timeouts.happy(),
                });
            }
            Err(e) if e.kind() == ErrorKind::Orphan => {
                // worker が居なくなっただけ。retry は消費しない
                warn!(task = %self.id, component = %name, worker = ?self.worker, error = %e, "no live worker; waiting for a suggestion");
                self.pending = None;
                self.worker = None;
            }
            Err(e) => {
                self.pending = None;
                self.abort_attempt(&format!("load of {name} failed: {e}"), fx);
            }
        }
    }

    fn on_happy(&mut self, component: ComponentId, result: Result<(), AdminError>, fx: &mut Effects) {
        if self.pending_component() != Some(component) {
            return;
        }
        match result {
            Ok(()) => {
                if let Some(c) = self.candidates.get_mut(&component) {
                    c.mood = Mood::Happy;
                }
                fx.push(Effect::FetchUiState {
                    task: self.id,
                    component,
                    purpose: UiPurpose::Elect,
                    timeout: self.timeouts.ui_state(),
                });
            }
            Err(e) => {
                self.pending = None;
                self.stop_component(component, fx);
                self.abort_attempt(&format!("component did not become happy: {e}"), fx);
            }
        }
    }

    fn on_ui_state_fetched(
        &mut self,
        component: ComponentId,
        purpose: UiPurpose,
        result: Result<UiState, AdminError>,
        fx: &mut Effects,
    ) {
        match purpose {
            UiPurpose::Elect => {
                if self.pending_component() != Some(component) {
                    return;
                }
                self.pending = None;
                match result {
                    Ok(ui_state) => {
                        if let Some(c) = self.candidates.get_mut(&component) {
                            c.ui_state = Some(ui_state);
                        }
                        self.retry = 0;
                        if self.state == TaskState::Started {
                            self.elect(component, fx);
                        } else {
                            debug!(task = %self.id, %component, state = %self.state, "loaded while not started; election deferred");
                        }
                    }
                    Err(e) => {
                        self.stop_component(component, fx);
                        self.abort_attempt(&format!("UI state unavailable: {e}"), fx);
                    }
                }
            }
            UiPurpose::Probe => {
                if !self.hold.as_ref().is_some_and(|h| h.component == component) {
                    return;
                }
                match result {
                    Ok(ui_state) => {
                        if let Some(c) = self.candidates.get_mut(&component) {
                            c.ui_state = Some(ui_state);
                        }
                        self.restore(fx);
                    }
                    Err(e) => {
                        debug!(task = %self.id, %component, error = %e, "probe failed; still holding");
                    }
                }
            }
        }
    }

    fn on_stopped(&mut self, component: ComponentId, result: Result<(), AdminError>, fx: &mut Effects) {
        self.stopping.remove(&component);
        self.candidates.remove(&component);
        if self.active == Some(component) {
            self.relieve(fx);
        }

        match &result {
            Ok(()) => debug!(task = %self.id, %component, "component stopped and deleted"),
            Err(e) if e.is_connection_lost() => {
                warn!(task = %self.id, %component, error = %e, "connection lost while stopping; it might still be running")
            }
            Err(e) => error!(task = %self.id, %component, error = %e, "could not force deletion"),
        }
        fx.publish_task(
            self.id,
            &self.label,
            TaskEvent::ComponentGone {
                component,
                confirmed: result.is_ok(),
            },
        );
    }

    fn on_timer(&mut self, timer: TaskTimer, token: u64, fx: &mut Effects) {
        match timer {
            TaskTimer::Retry => {
                if self.retry_token != Some(token) {
                    return;
                }
                self.retry_token = None;
                self.advance(fx);
            }
            TaskTimer::Probe => {
                let Some(hold) = self.hold.as_ref().filter(|h| h.token == token) else {
                    return;
                };
                let component = hold.component;
                fx.push(Effect::FetchUiState {
                    task: self.id,
                    component,
                    purpose: UiPurpose::Probe,
                    timeout: self.timeouts.ui_state(),
                });
                fx.schedule(
                    TimerKey::Task(self.id, TaskTimer::Probe),
                    token,
                    self.timeouts.probe_interval(),
                );
            }
            TaskTimer::Hold => {
                let Some(hold) = self.hold.take_if(|h| h.token == token) else {
                    return;
                };
                fx.cancel(TimerKey::Task(self.id, TaskTimer::Probe));
                warn!(task = %self.id, component = %hold.component, "held component still lost");
                self.relieve(fx);
                self.stop_component(hold.component, fx);
                self.abort_attempt(
                    &format!("component lost for {:?}", self.timeouts.hold()),
                    fx,
                );
                self.flush_deferred(fx);
            }
        }
    }

    fn on_mood(&mut self, component: ComponentId, mood: Mood, fx: &mut Effects) {
        let Some(snapshot) = self.candidates.get_mut(&component) else {
            return;
        };
        snapshot.mood = mood;

        if self.active == Some(component) {
            match mood {
                Mood::Lost => self.begin_hold(component, fx),
                Mood::Sad => {
                    let tolerated = self
                        .candidates
                        .get(&component)
                        .is_some_and(|c| self.kind.tolerates_sad(c));
                    if tolerated {
                        debug!(task = %self.id, %component, "elected component is sad; tolerated");
                        return;
                    }
                    warn!(task = %self.id, %component, "elected component went sad");
                    self.relieve(fx);
                    self.stop_component(component, fx);
                    self.abort_attempt("elected component went sad", fx);
                    self.flush_deferred(fx);
                }
                Mood::Happy if self.hold.is_some() => {
                    fx.push(Effect::FetchUiState {
                        task: self.id,
                        component,
                        purpose: UiPurpose::Probe,
                        timeout: self.timeouts.ui_state(),
                    });
                }
                _ => {}
            }
            return;
        }

        // pending 中の component は WaitHappy の結果で判断する
        if self.pending_component() == Some(component) {
            return;
        }
        self.advance(fx);
    }

    fn on_ui_state(&mut self, component: ComponentId, ui_state: UiState, fx: &mut Effects) {
        let Some(snapshot) = self.candidates.get_mut(&component) else {
            return;
        };
        snapshot.ui_state = Some(ui_state);

        if self.hold.as_ref().is_some_and(|h| h.component == component) {
            self.restore(fx);
        }
        if self.active == Some(component)
            && let Some(snapshot) = self.candidates.get(&component)
        {
            let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
            self.kind.on_ui_state(&mut ctx, snapshot);
        }
    }

    // =========================================================================
    // Election
    // =========================================================================

    fn advance(&mut self, fx: &mut Effects) {
        if self.state != TaskState::Started
            || self.exhausted
            || self.active.is_some()
            || self.pending.is_some()
            || self.retry_token.is_some()
            || self.hold.is_some()
        {
            return;
        }

        let candidates: Vec<&ComponentSnapshot> = self
            .candidates
            .values()
            .filter(|c| !self.stopping.contains(&c.id))
            .collect();
        if let Some(id) = self.kind.select_potential(&candidates, self.worker.as_ref()) {
            self.elect(id, fx);
            return;
        }

        if self.worker.is_none() {
            debug!(task = %self.id, "no worker; waiting for a suggestion");
            return;
        }
        self.load(fx);
    }

    fn load(&mut self, fx: &mut Effects) {
        let name = self
            .ids
            .component_name(self.kind.component_kind(), &self.label);
        info!(
            task = %self.id,
            component = %name,
            worker = ?self.worker,
            retry = self.retry,
            "loading component"
        );
        self.pending = Some(PendingLoad {
            name: name.clone(),
            component: None,
        });
        fx.push(Effect::Load {
            task: self.id,
            request: LoadRequest {
                kind: self.kind.component_kind(),
                name,
                label: self.label.clone(),
                properties: self.kind.properties(),
                worker: self.worker.clone(),
                timeout: self.timeouts.load(),
            },
        });
    }

    /// Relieve-before-elect; every other candidate is stopped.
    fn elect(&mut self, component: ComponentId, fx: &mut Effects) {
        if self.active == Some(component) {
            return;
        }
        self.relieve(fx);
        self.active = Some(component);
        info!(task = %self.id, %component, "component elected");
        fx.publish_task(self.id, &self.label, TaskEvent::Elected { component });

        if let Some(snapshot) = self.candidates.get(&component) {
            let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
            self.kind.on_elected(&mut ctx, snapshot);
        }

        let others: Vec<ComponentId> = self
            .candidates
            .keys()
            .filter(|c| **c != component && !self.stopping.contains(c))
            .copied()
            .collect();
        for other in others {
            self.stop_component(other, fx);
        }
    }

    fn relieve(&mut self, fx: &mut Effects) {
        let Some(component) = self.active.take() else {
            return;
        };
        if self.hold.take().is_some() {
            fx.cancel(TimerKey::Task(self.id, TaskTimer::Hold));
            fx.cancel(TimerKey::Task(self.id, TaskTimer::Probe));
        }
        info!(task = %self.id, %component, "component relieved");
        fx.publish_task(self.id, &self.label, TaskEvent::Relieved { component });

        let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
        self.kind.on_relieved(&mut ctx, component);
    }

    fn stop_component(&mut self, component: ComponentId, fx: &mut Effects) {
        if !self.stopping.insert(component) {
            return;
        }
        if self.active == Some(component) {
            self.relieve(fx);
        }
        debug!(task = %self.id, %component, "stopping component");
        fx.push(Effect::Stop {
            task: Some(self.id),
            component,
        });
    }

    fn abort_attempt(&mut self, reason: &str, fx: &mut Effects) {
        self.relieve(fx);
        self.retry += 1;
        let max_retries = self.kind.max_retries();

        if self.retry <= max_retries {
            let delay = self.policy.delay_for(self.retry);
            warn!(
                task = %self.id,
                retry = self.retry,
                max_retries,
                ?delay,
                reason,
                "attempt aborted; retrying"
            );
            fx.publish_task(
                self.id,
                &self.label,
                TaskEvent::Retrying {
                    attempt: self.retry,
                    delay,
                },
            );
            let token = self.token();
            self.retry_token = Some(token);
            fx.schedule(TimerKey::Task(self.id, TaskTimer::Retry), token, delay);
            return;
        }

        self.exhausted = true;
        error!(task = %self.id, retries = max_retries, reason, "retries exhausted; task aborted");
        fx.publish_task(
            self.id,
            &self.label,
            TaskEvent::Aborted {
                retries: max_retries,
                reason: reason.to_string(),
            },
        );
        let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
        self.kind.on_aborted(&mut ctx, reason);
    }

    // =========================================================================
    // Hold
    // =========================================================================

    fn begin_hold(&mut self, component: ComponentId, fx: &mut Effects) {
        if self.hold.is_some() {
            return;
        }
        let token = self.token();
        self.hold = Some(Hold { component, token });
        warn!(task = %self.id, %component, hold = ?self.timeouts.hold(), "elected component lost; holding");
        fx.publish_task(self.id, &self.label, TaskEvent::Held { component });
        fx.schedule(
            TimerKey::Task(self.id, TaskTimer::Hold),
            token,
            self.timeouts.hold(),
        );
        fx.schedule(
            TimerKey::Task(self.id, TaskTimer::Probe),
            token,
            self.timeouts.probe_interval(),
        );
    }

    fn restore(&mut self, fx: &mut Effects) {
        let Some(hold) = self.hold.take() else {
            return;
        };
        fx.cancel(TimerKey::Task(self.id, TaskTimer::Hold));
        fx.cancel(TimerKey::Task(self.id, TaskTimer::Probe));
        info!(task = %self.id, component = %hold.component, "held component restored");
        fx.publish_task(
            self.id,
            &self.label,
            TaskEvent::Restored {
                component: hold.component,
            },
        );

        if let Some(snapshot) = self.candidates.get(&hold.component) {
            let mut ctx = TaskCtx::new(self.id, &self.label, &self.timeouts, fx);
            self.kind.on_restored(&mut ctx, snapshot);
        }
        self.flush_deferred(fx);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn pending_component(&self) -> Option<ComponentId> {
        self.pending.as_ref().and_then(|p| p.component)
    }

    fn cancel_retry(&mut self, fx: &mut Effects) {
        if self.retry_token.take().is_some() {
            fx.cancel(TimerKey::Task(self.id, TaskTimer::Retry));
        }
    }

    fn cancel_timers(&mut self, fx: &mut Effects) {
        self.cancel_retry(fx);
        if self.hold.take().is_some() {
            fx.cancel(TimerKey::Task(self.id, TaskTimer::Hold));
            fx.cancel(TimerKey::Task(self.id, TaskTimer::Probe));
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Push the current status into the waiters.
    fn sync(&self) {
        let busy = usize::from(self.pending.is_some()) + self.stopping.len();
        self.idle.set_counter(busy);
        self.assigned.set_value(self.worker.clone());

        let election = if self.active.is_some() {
            Election::Elected
        } else if self.exhausted || self.state.is_terminal() {
            Election::Aborted
        } else {
            Election::Searching
        };
        self.status.set_value(election);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::component::{ComponentKind, ComponentProperties};
    use crate::domain::events::ServiceEvent;
    use crate::ports::{SystemClock, UlidGenerator};

    /// Minimal kind: happy components are potential.
    #[derive(Default)]
    pub(crate) struct FakeKind {
        pub name: &'static str,
        pub max_retries: u32,
        pub aborted: u32,
        pub restored: u32,
        pub elected: Vec<ComponentId>,
    }

    impl TaskKind for FakeKind {
        fn component_kind(&self) -> ComponentKind {
            ComponentKind::Monitor
        }

        fn properties(&self) -> ComponentProperties {
            ComponentProperties::new().with("name", self.name)
        }

        fn max_retries(&self) -> u32 {
            self.max_retries
        }

        fn is_potential(&self, component: &ComponentSnapshot) -> bool {
            component.mood == Mood::Happy
        }

        fn on_elected(&mut self, _ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
            self.elected.push(component.id);
        }

        fn on_aborted(&mut self, _ctx: &mut TaskCtx<'_>, _reason: &str) {
            self.aborted += 1;
        }

        fn on_restored(&mut self, _ctx: &mut TaskCtx<'_>, _component: &ComponentSnapshot) {
            self.restored += 1;
        }
    }

    fn settings() -> TaskSettings {
        TaskSettings {
            retry: RetryPolicy {
                base_delay_ms: 1_000,
                multiplier: 2.0,
                max_delay_ms: 60_000,
            },
            timeouts: TaskTimeouts {
                hold_ms: 60_000,
                probe_interval_ms: 10_000,
                ..TaskTimeouts::default()
            },
        }
    }

    fn task(max_retries: u32) -> AdminTask<FakeKind> {
        AdminTask::new(
            TaskId::generate(),
            "fake",
            FakeKind {
                max_retries,
                ..FakeKind::default()
            },
            settings(),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    fn w1() -> WorkerName {
        WorkerName::new("w1")
    }

    fn happy_on_w1() -> ComponentSnapshot {
        ComponentSnapshot::new(ComponentId::generate(), "c", ComponentKind::Monitor)
            .on_worker(w1())
            .with_mood(Mood::Happy)
    }

    pub(crate) fn loads(fx: &Effects) -> Vec<String> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Load { request, .. } => Some(request.name.clone()),
                _ => None,
            })
            .collect()
    }

    fn scheduled(fx: &Effects, timer: TaskTimer) -> Option<(u64, Duration)> {
        fx.iter().rev().find_map(|e| match e {
            Effect::Schedule {
                key: TimerKey::Task(_, t),
                token,
                delay,
            } if *t == timer => Some((*token, *delay)),
            _ => None,
        })
    }

    pub(crate) fn task_events(fx: &Effects) -> Vec<TaskEvent> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Publish(ServiceEvent::Task { event, .. }) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn fail_load(task: &mut AdminTask<FakeKind>, name: String, fx: &mut Effects) {
        task.handle(
            Input::LoadFinished {
                task: task.id(),
                name,
                result: Err(AdminError::timeout("load", Duration::from_secs(30))),
            },
            fx,
        );
    }

    #[test]
    fn illegal_transitions_name_both_states() {
        let mut t = task(0);
        let mut fx = Effects::new();

        let err = t.pause(&mut fx).unwrap_err();
        assert_eq!(
            err,
            AdminError::StateConflict {
                label: "fake".into(),
                current: TaskState::Stopped,
                target: TaskState::Pausing,
            }
        );
    }

    #[test]
    fn start_paused_ends_paused_without_loading() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(true, &mut fx).unwrap();

        assert_eq!(t.state(), TaskState::Paused);
        assert!(loads(&fx).is_empty());

        t.resume(&mut fx).unwrap();
        assert_eq!(t.state(), TaskState::Started);
        assert_eq!(loads(&fx).len(), 1);
    }

    #[test]
    fn exhausts_retries_then_stays_quiet() {
        let mut t = task(1);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(false, &mut fx).unwrap();
        let first = loads(&fx);
        assert_eq!(first.len(), 1);

        let mut fx = Effects::new();
        fail_load(&mut t, first[0].clone(), &mut fx);
        let (token, delay) = scheduled(&fx, TaskTimer::Retry).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        assert!(task_events(&fx).contains(&TaskEvent::Retrying {
            attempt: 1,
            delay: Duration::from_secs(1)
        }));

        let mut fx = Effects::new();
        t.handle(
            Input::TimerFired {
                key: TimerKey::Task(t.id(), TaskTimer::Retry),
                token,
            },
            &mut fx,
        );
        let second = loads(&fx);
        assert_eq!(second.len(), 1);
        assert_ne!(second[0], first[0]);

        let mut fx = Effects::new();
        fail_load(&mut t, second[0].clone(), &mut fx);
        let aborted: Vec<_> = task_events(&fx)
            .into_iter()
            .filter(|e| matches!(e, TaskEvent::Aborted { .. }))
            .collect();
        assert_eq!(aborted.len(), 1);
        assert!(scheduled(&fx, TaskTimer::Retry).is_none());
        assert_eq!(t.kind().aborted, 1);
        assert!(t.is_exhausted());

        // 古いタイマーや mood の変化では二度と load しない
        let mut fx = Effects::new();
        t.handle(
            Input::TimerFired {
                key: TimerKey::Task(t.id(), TaskTimer::Retry),
                token,
            },
            &mut fx,
        );
        t.add_component(
            ComponentSnapshot::new(ComponentId::generate(), "x", ComponentKind::Monitor)
                .on_worker(w1())
                .with_mood(Mood::Sad),
            &mut fx,
        );
        assert!(loads(&fx).is_empty());
        assert_eq!(t.kind().aborted, 1);

        // worker の提案でリセットされる
        let mut fx = Effects::new();
        assert!(t.suggest_worker(Some(w1()), &mut fx));
        assert_eq!(t.retry(), 0);
        assert_eq!(loads(&fx).len(), 1);
    }

    #[test]
    fn only_one_load_is_ever_pending() {
        let mut t = task(3);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(false, &mut fx).unwrap();

        let stranger = ComponentSnapshot::new(ComponentId::generate(), "s", ComponentKind::Monitor)
            .on_worker(w1())
            .with_mood(Mood::Waking);
        t.add_component(stranger.clone(), &mut fx);
        t.handle(
            Input::MoodChanged {
                component: stranger.id,
                mood: Mood::Sad,
            },
            &mut fx,
        );
        t.suggest_worker(Some(w1()), &mut fx);

        assert_eq!(loads(&fx).len(), 1);
        assert!(t.is_loading());
        assert!(!t.is_idle());
    }

    #[test]
    fn loaded_component_is_elected_after_happy_and_ui_state() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(false, &mut fx).unwrap();
        let name = loads(&fx).remove(0);

        let snapshot = ComponentSnapshot::new(ComponentId::generate(), name.clone(), ComponentKind::Monitor)
            .on_worker(w1());
        let id = snapshot.id;
        let mut fx = Effects::new();
        t.handle(
            Input::LoadFinished {
                task: t.id(),
                name,
                result: Ok(snapshot),
            },
            &mut fx,
        );
        t.handle(
            Input::HappyFinished {
                task: t.id(),
                component: id,
                result: Ok(()),
            },
            &mut fx,
        );
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::FetchUiState {
                purpose: UiPurpose::Elect,
                ..
            }
        )));
        t.handle(
            Input::UiStateFetched {
                task: t.id(),
                component: id,
                purpose: UiPurpose::Elect,
                result: Ok(UiState::new(serde_json::json!({}))),
            },
            &mut fx,
        );

        assert_eq!(t.active().map(|c| c.id), Some(id));
        assert!(t.is_idle());
        assert_eq!(t.kind().elected, vec![id]);
    }

    #[test]
    fn sad_loaded_component_is_stopped_and_retried() {
        let mut t = task(2);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(false, &mut fx).unwrap();
        let name = loads(&fx).remove(0);
        let snapshot = ComponentSnapshot::new(ComponentId::generate(), name.clone(), ComponentKind::Monitor);
        let id = snapshot.id;

        let mut fx = Effects::new();
        t.handle(
            Input::LoadFinished {
                task: t.id(),
                name,
                result: Ok(snapshot),
            },
            &mut fx,
        );
        t.handle(
            Input::HappyFinished {
                task: t.id(),
                component: id,
                result: Err(AdminError::Rejected("went sad".into())),
            },
            &mut fx,
        );

        assert!(fx.iter().any(|e| matches!(e, Effect::Stop { component, .. } if *component == id)));
        assert_eq!(t.retry(), 1);
        assert!(scheduled(&fx, TaskTimer::Retry).is_some());
    }

    #[test]
    fn elected_and_relieved_strictly_alternate() {
        let mut t = task(1);
        let mut fx = Effects::new();
        t.start(false, &mut fx).unwrap();

        let c1 = happy_on_w1();
        let c2 = happy_on_w1();
        t.add_component(c1.clone(), &mut fx);
        t.add_component(c2.clone(), &mut fx);
        assert_eq!(t.active().map(|c| c.id), Some(c1.id));

        t.remove_component(c1.id, &mut fx);
        assert_eq!(t.active().map(|c| c.id), Some(c2.id));

        t.handle(
            Input::MoodChanged {
                component: c2.id,
                mood: Mood::Sad,
            },
            &mut fx,
        );
        assert!(t.active().is_none());

        let mut elected = false;
        for event in task_events(&fx) {
            match event {
                TaskEvent::Elected { .. } => {
                    assert!(!elected, "two elections without a relief");
                    elected = true;
                }
                TaskEvent::Relieved { .. } => {
                    assert!(elected, "relief without an election");
                    elected = false;
                }
                _ => {}
            }
        }
        assert!(!elected);
    }

    #[test]
    fn recovered_hold_keeps_component_without_retry() {
        let mut t = task(2);
        let mut fx = Effects::new();
        t.start(false, &mut fx).unwrap();
        let c = happy_on_w1();
        t.add_component(c.clone(), &mut fx);

        let mut fx = Effects::new();
        t.handle(
            Input::MoodChanged {
                component: c.id,
                mood: Mood::Lost,
            },
            &mut fx,
        );
        assert!(t.is_holding());
        let (hold_token, hold_delay) = scheduled(&fx, TaskTimer::Hold).unwrap();
        assert_eq!(hold_delay, Duration::from_secs(60));
        let (probe_token, _) = scheduled(&fx, TaskTimer::Probe).unwrap();

        // t=10: probe fails, t=20: probe fails, t=30: probe succeeds
        for ok in [false, false, true] {
            let mut fx = Effects::new();
            t.handle(
                Input::TimerFired {
                    key: TimerKey::Task(t.id(), TaskTimer::Probe),
                    token: probe_token,
                },
                &mut fx,
            );
            let result = if ok {
                Ok(UiState::new(serde_json::json!({ "alive": true })))
            } else {
                Err(AdminError::ConnectionLost("worker unreachable".into()))
            };
            t.handle(
                Input::UiStateFetched {
                    task: t.id(),
                    component: c.id,
                    purpose: UiPurpose::Probe,
                    result,
                },
                &mut fx,
            );
            if ok {
                assert!(fx.iter().any(|e| matches!(
                    e,
                    Effect::Cancel {
                        key: TimerKey::Task(_, TaskTimer::Hold)
                    }
                )));
            }
        }

        assert!(!t.is_holding());
        assert_eq!(t.active().map(|s| s.id), Some(c.id));
        assert_eq!(t.retry(), 0);
        assert_eq!(t.kind().restored, 1);

        // 期限切れの hold タイマーが遅れて届いても無視される
        let mut fx = Effects::new();
        t.handle(
            Input::TimerFired {
                key: TimerKey::Task(t.id(), TaskTimer::Hold),
                token: hold_token,
            },
            &mut fx,
        );
        assert!(fx.is_empty());
    }

    #[test]
    fn expired_hold_costs_exactly_one_retry() {
        let mut t = task(2);
        let mut fx = Effects::new();
        t.start(false, &mut fx).unwrap();
        let c = happy_on_w1();
        t.add_component(c.clone(), &mut fx);
        t.handle(
            Input::MoodChanged {
                component: c.id,
                mood: Mood::Lost,
            },
            &mut fx,
        );
        let (hold_token, _) = scheduled(&fx, TaskTimer::Hold).unwrap();

        // 保留中の worker 提案は hold が終わるまで待たされる
        assert!(!t.suggest_worker(Some(WorkerName::new("w2")), &mut fx));

        let mut fx = Effects::new();
        t.handle(
            Input::TimerFired {
                key: TimerKey::Task(t.id(), TaskTimer::Hold),
                token: hold_token,
            },
            &mut fx,
        );

        let events = task_events(&fx);
        assert!(events.contains(&TaskEvent::Relieved { component: c.id }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, TaskEvent::Retrying { .. }))
                .count(),
            1
        );
        assert!(fx.iter().any(|e| matches!(e, Effect::Stop { component, .. } if *component == c.id)));
        // 遅延していた提案が適用される
        assert_eq!(t.worker(), Some(&WorkerName::new("w2")));
    }

    #[test]
    fn stop_hands_components_back() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.start(false, &mut fx).unwrap();
        let c = happy_on_w1();
        t.add_component(c.clone(), &mut fx);

        let released = t.stop(&mut fx).unwrap();

        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, c.id);
        assert_eq!(t.state(), TaskState::Terminated);
        assert!(task_events(&fx).contains(&TaskEvent::Relieved { component: c.id }));
    }

    #[test]
    fn abort_is_idempotent() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.abort(&mut fx);
        t.abort(&mut fx);
        assert_eq!(t.state(), TaskState::Terminated);
        assert_eq!(task_events(&fx).len(), 1);
    }

    #[test]
    fn orphaned_load_waits_for_a_worker_without_spending_retries() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(false, &mut fx).unwrap();
        let name = loads(&fx).remove(0);

        let mut fx = Effects::new();
        t.handle(
            Input::LoadFinished {
                task: t.id(),
                name,
                result: Err(AdminError::Orphan("unknown worker w1".into())),
            },
            &mut fx,
        );

        assert!(!t.is_exhausted());
        assert_eq!(t.retry(), 0);
        assert_eq!(t.kind().aborted, 0);
        assert!(t.worker().is_none());
        assert!(t.is_idle());
        assert!(scheduled(&fx, TaskTimer::Retry).is_none());
        assert!(
            !task_events(&fx)
                .iter()
                .any(|e| matches!(e, TaskEvent::Aborted { .. } | TaskEvent::Retrying { .. }))
        );

        // worker が戻れば改めて load する
        let mut fx = Effects::new();
        assert!(t.suggest_worker(Some(w1()), &mut fx));
        assert_eq!(loads(&fx).len(), 1);
    }

    #[test]
    fn load_finished_while_paused_is_elected_on_resume() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(false, &mut fx).unwrap();
        let name = loads(&fx).remove(0);
        let snapshot = ComponentSnapshot::new(ComponentId::generate(), name.clone(), ComponentKind::Monitor)
            .on_worker(w1());
        let id = snapshot.id;
        t.handle(
            Input::LoadFinished {
                task: t.id(),
                name,
                result: Ok(snapshot),
            },
            &mut fx,
        );
        t.handle(
            Input::HappyFinished {
                task: t.id(),
                component: id,
                result: Ok(()),
            },
            &mut fx,
        );

        t.pause(&mut fx).unwrap();
        let mut fx = Effects::new();
        t.handle(
            Input::UiStateFetched {
                task: t.id(),
                component: id,
                purpose: UiPurpose::Elect,
                result: Ok(UiState::new(serde_json::json!({}))),
            },
            &mut fx,
        );

        assert_eq!(t.state(), TaskState::Paused);
        assert!(t.active().is_none());
        assert!(t.has_component(id));
        assert!(t.is_idle());
        assert!(!task_events(&fx).iter().any(|e| matches!(e, TaskEvent::Elected { .. })));
        assert!(!fx.iter().any(|e| matches!(e, Effect::Stop { .. })));

        let mut fx = Effects::new();
        t.resume(&mut fx).unwrap();
        assert_eq!(t.active().map(|c| c.id), Some(id));
        assert!(task_events(&fx).contains(&TaskEvent::Elected { component: id }));
        assert!(loads(&fx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_worker_resolves_on_assignment() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.start(false, &mut fx).unwrap();

        let err = t.wait_worker(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let wait = t.wait_worker(Duration::from_secs(10));
        t.suggest_worker(None, &mut fx);
        t.suggest_worker(Some(w1()), &mut fx);
        assert_eq!(wait.await.unwrap(), w1());

        // 既に割り当て済みなら即座に返る
        assert_eq!(t.wait_worker(Duration::ZERO).await.unwrap(), w1());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_active_fails_once_aborted() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.suggest_worker(Some(w1()), &mut fx);
        t.start(false, &mut fx).unwrap();
        let wait = t.wait_active(Duration::from_secs(60));

        let name = loads(&fx).remove(0);
        fail_load(&mut t, name, &mut fx);

        let err = wait.await.unwrap_err();
        assert!(matches!(err, AdminError::Rejected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_resolves_when_deletions_finish() {
        let mut t = task(0);
        let mut fx = Effects::new();
        t.start(false, &mut fx).unwrap();
        let waking = ComponentSnapshot::new(ComponentId::generate(), "w", ComponentKind::Monitor)
            .on_worker(w1())
            .with_mood(Mood::Waking);
        t.add_component(waking.clone(), &mut fx);
        t.add_component(happy_on_w1(), &mut fx);

        // 選出されなかった候補は停止中
        assert!(!t.is_idle());
        let wait = t.wait_idle(Duration::from_secs(5));

        t.handle(
            Input::Stopped {
                task: Some(t.id()),
                component: waking.id,
                result: Ok(()),
            },
            &mut fx,
        );
        assert_eq!(wait.await.unwrap(), 0);
        assert!(!t.has_component(waking.id));
    }
}
