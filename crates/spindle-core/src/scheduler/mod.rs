//! Scheduler - 変換ジョブの優先度キューと受け入れ制御
//!
//! # 流れ
//! 1. `add_profile` でキューへ（キュー済み・実行中なら何もしない）
//! 2. 受け入れ（admission）は 0 遅延タイマー 1 本で束ねる
//! 3. 空きスロット（worker 容量の合計 − 実行中）がある間、優先度順に TranscodingTask を開始
//! 4. ジョブ終了（`JobFinished`）→ レポート取得 → done / failed を publish、活動記録、通知
//! 5. retry を使い切ったタスク（`Aborted`）は「動かせなかった」ジョブとして即終了、緊急通知
//!
//! `wait_outcome` でキュー済み・実行中の profile の結果を待てる。取り消されると Rejected。
//!
//! 優先度は `customer * 1000 + profile` の単純な並び。公平性の調整はしない。

mod queue;

pub use queue::{ProfileQueue, QueuedProfile};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::admin::{
    AdminFuture, AdminTask, ManagerSettings, TaskManager, TaskSettings, TranscodingTask,
};
use crate::domain::activity::{ActivityRecord, TranscodingActivity};
use crate::domain::component::ComponentKind;
use crate::domain::errors::AdminError;
use crate::domain::events::{JobOutcome, SchedulerEvent, TaskEvent};
use crate::domain::ids::{ComponentId, TaskId};
use crate::domain::notification::{
    Document, NotificationKind, NotificationLevel, NotificationSpec, NotifyRequest, NotifyTrigger,
};
use crate::domain::profile::{ProfileContext, ProfileKey, TranscodingParams};
use crate::domain::state::{JobState, ManagerState};
use crate::ports::{Clock, IdGenerator};
use crate::runtime::{Effect, Effects, Input, Machine, TimerKey};
use crate::waiters::{PassiveWaiter, WaitError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub admission_delay_ms: u64,
    pub report_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            admission_delay_ms: 0,
            report_timeout_ms: 10_000,
            max_retries: crate::admin::transcoding::DEFAULT_TRANSCODER_RETRIES,
        }
    }
}

impl SchedulerSettings {
    pub fn admission_delay(&self) -> Duration {
        Duration::from_millis(self.admission_delay_ms)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_millis(self.report_timeout_ms)
    }
}

/// Totals since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerCounts {
    pub queued: usize,
    pub active: usize,
    pub done: usize,
    pub failed: usize,
}

/// One admitted profile.
#[derive(Debug)]
pub struct ActiveJob {
    pub context: ProfileContext,
    pub params: TranscodingParams,
    pub task: TaskId,
    pub activity: TranscodingActivity,
    pub component: Option<ComponentId>,
    pub outcome: Option<JobOutcome>,
    /// Waiting for the job report before finishing.
    awaiting_report: bool,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    task_settings: TaskSettings,
    manager: TaskManager<TranscodingTask>,
    queue: ProfileQueue,
    active: HashMap<ProfileKey, ActiveJob>,
    by_task: HashMap<TaskId, ProfileKey>,
    /// One per queued or running profile.
    outcomes: HashMap<ProfileKey, PassiveWaiter<JobOutcome, AdminError>>,
    /// Declared once for every profile.
    global_notifications: Vec<NotificationSpec>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    admission: Option<u64>,
    next_token: u64,
    done: usize,
    failed: usize,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        manager: ManagerSettings,
        task_settings: TaskSettings,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            task_settings,
            manager: TaskManager::new(ComponentKind::Transcoder, manager),
            queue: ProfileQueue::new(),
            active: HashMap::new(),
            by_task: HashMap::new(),
            outcomes: HashMap::new(),
            global_notifications: Vec::new(),
            ids,
            clock,
            admission: None,
            next_token: 0,
            done: 0,
            failed: 0,
        }
    }

    pub fn with_notifications(mut self, global: Vec<NotificationSpec>) -> Self {
        self.global_notifications = global;
        self
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn manager(&self) -> &TaskManager<TranscodingTask> {
        &self.manager
    }

    pub fn is_queued(&self, key: &ProfileKey) -> bool {
        self.queue.contains(key)
    }

    pub fn is_active(&self, key: &ProfileKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn job(&self, key: &ProfileKey) -> Option<&ActiveJob> {
        self.active.get(key)
    }

    pub fn job_of_task(&self, task: TaskId) -> Option<&ActiveJob> {
        self.by_task.get(&task).and_then(|key| self.active.get(key))
    }

    /// Worker capacity left for new jobs.
    pub fn free_slots(&self) -> usize {
        self.manager.capacity().saturating_sub(self.active.len())
    }

    /// Nothing queued, nothing running.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty()
    }

    pub fn counts(&self) -> SchedulerCounts {
        SchedulerCounts {
            queued: self.queue.len(),
            active: self.active.len(),
            done: self.done,
            failed: self.failed,
        }
    }

    /// Resolves with the outcome of a queued or running profile.
    ///
    /// Fails with `Rejected` when the profile is removed or the scheduler aborts.
    pub fn wait_outcome(&self, key: &ProfileKey, timeout: Duration) -> AdminFuture<JobOutcome> {
        let Some(outcome) = self.outcomes.get(key) else {
            let err = AdminError::Rejected(format!("profile {key} is not scheduled"));
            return Box::pin(std::future::ready(Err(err)));
        };
        let wait = outcome.wait(timeout);
        let key = key.clone();
        Box::pin(async move {
            wait.await.map_err(|e| match e {
                WaitError::Timeout(after) => AdminError::timeout(format!("outcome of {key}"), after),
                WaitError::Failed(e) => e,
                WaitError::Dropped => AdminError::Remote(format!("scheduler dropped {key}")),
            })
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn start(&mut self, paused: bool, fx: &mut Effects) -> Result<(), AdminError> {
        let mark = fx.mark();
        self.manager.start(paused, fx)?;
        self.observe(mark, fx);
        self.request_admission(fx);
        Ok(())
    }

    pub fn pause(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        self.manager.pause(fx)
    }

    pub fn resume(&mut self, fx: &mut Effects) -> Result<(), AdminError> {
        self.manager.resume(fx)?;
        self.request_admission(fx);
        Ok(())
    }

    pub fn abort(&mut self, fx: &mut Effects) {
        if self.admission.take().is_some() {
            fx.cancel(TimerKey::Admission);
        }
        self.manager.abort(fx);
        for (key, outcome) in self.outcomes.drain() {
            let _ = outcome.fail(AdminError::Rejected(format!("scheduler aborted before {key} finished")));
        }
    }

    // =========================================================================
    // Profiles
    // =========================================================================

    /// Queue a profile. Returns `false` when it is already queued or running.
    pub fn add_profile(
        &mut self,
        context: ProfileContext,
        params: TranscodingParams,
        fx: &mut Effects,
    ) -> bool {
        let key = context.key.clone();
        if self.active.contains_key(&key) || !self.queue.push(context, params) {
            info!(profile = %key, "profile already scheduled; ignored");
            return false;
        }
        debug!(profile = %key, queued = self.queue.len(), "profile queued");
        self.outcomes.insert(key.clone(), PassiveWaiter::new());
        fx.publish(SchedulerEvent::ProfileQueued { profile: key }.into());
        self.request_admission(fx);
        true
    }

    /// Dequeue a profile, or cancel its job unless it already waits for acknowledgement.
    pub fn remove_profile(&mut self, key: &ProfileKey, fx: &mut Effects) -> bool {
        if self.queue.remove(key).is_some() {
            info!(profile = %key, "queued profile removed");
            self.cancel_outcome(key);
            fx.publish(
                SchedulerEvent::ProfileRemoved {
                    profile: key.clone(),
                }
                .into(),
            );
            return true;
        }

        let Some(job) = self.active.get(key) else {
            return false;
        };
        let job_state = self
            .manager
            .task(job.task)
            .map(|t| t.kind().job_state())
            .unwrap_or(JobState::Pending);
        if job_state != JobState::Pending {
            info!(profile = %key, ?job_state, "job is finishing; not cancelled");
            return false;
        }

        let Some(job) = self.active.remove(key) else {
            return false;
        };
        self.by_task.remove(&job.task);
        if let Err(e) = self.manager.remove_task(job.task, true, fx) {
            warn!(task = %job.task, error = %e, "could not remove cancelled task");
        }
        fx.push(Effect::DeleteActivity(job.activity.id));
        info!(profile = %key, task = %job.task, "active job cancelled");
        self.cancel_outcome(key);
        fx.publish(
            SchedulerEvent::ProfileRemoved {
                profile: key.clone(),
            }
            .into(),
        );
        self.request_admission(fx);
        true
    }

    fn cancel_outcome(&mut self, key: &ProfileKey) {
        if let Some(outcome) = self.outcomes.remove(key) {
            let _ = outcome.fail(AdminError::Rejected(format!("profile {key} was removed")));
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    fn request_admission(&mut self, fx: &mut Effects) {
        if self.admission.is_some() {
            return;
        }
        self.next_token += 1;
        self.admission = Some(self.next_token);
        fx.schedule(
            TimerKey::Admission,
            self.next_token,
            self.settings.admission_delay(),
        );
    }

    fn on_admission(&mut self, token: u64, fx: &mut Effects) {
        if self.admission != Some(token) {
            return;
        }
        self.admission = None;
        self.admit(fx);
    }

    fn admit(&mut self, fx: &mut Effects) {
        if !matches!(self.manager.state(), ManagerState::Started) {
            debug!(state = ?self.manager.state(), "admission skipped; manager not started");
            return;
        }
        let mut slots = self.free_slots();
        while slots > 0 {
            let Some(queued) = self.queue.pop() else {
                break;
            };
            if self.start_job(queued, fx) {
                slots -= 1;
            }
        }
    }

    fn start_job(&mut self, queued: QueuedProfile, fx: &mut Effects) -> bool {
        let QueuedProfile { context, params } = queued;
        let key = context.key.clone();
        let id = self.ids.task_id();
        let kind = TranscodingTask::new(context.clone(), params.clone(), self.settings.max_retries);
        let task = AdminTask::new(
            id,
            context.label.clone(),
            kind,
            self.task_settings.clone(),
            Arc::clone(&self.ids),
        );

        let activity = TranscodingActivity::new(
            self.ids.activity_id(),
            context.label.clone(),
            key.clone(),
            self.clock.now(),
        );
        self.by_task.insert(id, key.clone());
        self.active.insert(
            key.clone(),
            ActiveJob {
                context,
                params,
                task: id,
                activity: activity.clone(),
                component: None,
                outcome: None,
                awaiting_report: false,
            },
        );

        let mark = fx.mark();
        if let Err(e) = self.manager.add_task(task, fx) {
            error!(profile = %key, error = %e, "could not start transcoding task");
            self.by_task.remove(&id);
            self.active.remove(&key);
            return false;
        }
        info!(profile = %key, task = %id, "transcoding started");
        fx.push(Effect::StoreActivity(ActivityRecord::Transcoding(activity)));
        fx.publish(SchedulerEvent::TranscodingStarted { profile: key, task: id }.into());
        // 引き継いだ component がすでに終わっていることもある
        self.observe(mark, fx);
        true
    }

    // =========================================================================
    // Job completion
    // =========================================================================

    /// React to task events published since `mark`.
    fn observe(&mut self, mark: usize, fx: &mut Effects) {
        for (task, event) in fx.task_events_since(mark) {
            match event {
                TaskEvent::Elected { component } => {
                    if let Some(job) = self.job_mut(task) {
                        job.component = Some(component);
                    }
                }
                TaskEvent::JobFinished { component, outcome } => {
                    self.on_job_finished(task, component, outcome, fx)
                }
                TaskEvent::Aborted { retries, reason } => {
                    self.on_task_aborted(task, retries, reason, fx)
                }
                _ => {}
            }
        }
    }

    fn job_mut(&mut self, task: TaskId) -> Option<&mut ActiveJob> {
        let key = self.by_task.get(&task)?;
        self.active.get_mut(key)
    }

    fn on_job_finished(
        &mut self,
        task: TaskId,
        component: ComponentId,
        outcome: JobOutcome,
        fx: &mut Effects,
    ) {
        let timeout = self.settings.report_timeout();
        let Some(job) = self.job_mut(task) else {
            return;
        };
        if job.awaiting_report {
            return;
        }
        job.component = Some(component);
        job.outcome = Some(outcome);
        job.awaiting_report = true;
        fx.push(Effect::FetchReport {
            task,
            component,
            timeout,
        });
    }

    fn on_report(&mut self, task: TaskId, result: Result<Document, AdminError>, fx: &mut Effects) {
        if !self.job_of_task(task).is_some_and(|j| j.awaiting_report) {
            return;
        }
        let report = match result {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(%task, error = %e, "job report unavailable; finishing without it");
                None
            }
        };
        self.finish_job(task, report, false, fx);
    }

    fn on_task_aborted(&mut self, task: TaskId, retries: u32, reason: String, fx: &mut Effects) {
        let Some(job) = self.job_mut(task) else {
            return;
        };
        if job.awaiting_report {
            return;
        }
        job.outcome = Some(JobOutcome::Failed {
            reason: format!("could not run after {retries} retries: {reason}"),
        });
        self.finish_job(task, None, true, fx);
    }

    fn finish_job(
        &mut self,
        task: TaskId,
        report: Option<Document>,
        emergency: bool,
        fx: &mut Effects,
    ) {
        let Some(key) = self.by_task.remove(&task) else {
            return;
        };
        let Some(mut job) = self.active.remove(&key) else {
            return;
        };

        let worker = self.manager.task(task).and_then(|t| t.worker().cloned());
        let retries = self.manager.task(task).map(|t| t.retry()).unwrap_or(0);
        if let Err(e) = self.manager.remove_task(task, true, fx) {
            warn!(%task, error = %e, "could not remove finished task");
        }

        let now = self.clock.now();
        job.activity.worker = worker.clone();
        let outcome = job.outcome.clone().unwrap_or(JobOutcome::Failed {
            reason: "no outcome reported".into(),
        });

        let mut documents: Vec<Document> = report.into_iter().collect();
        let trigger = match &outcome {
            JobOutcome::Done => {
                self.done += 1;
                job.activity.mark_done(now);
                info!(profile = %key, %task, "transcoding done");
                fx.publish(SchedulerEvent::TranscodingDone { profile: key.clone(), task }.into());
                NotifyTrigger::Done
            }
            JobOutcome::Failed { reason } => {
                self.failed += 1;
                let diagnostics = diagnose(&job, reason, worker.as_ref().map(|w| w.as_str()), retries);
                documents.push(Document {
                    label: "diagnostics".into(),
                    mime_type: "text/plain".into(),
                    body: diagnostics.join("\n"),
                });
                job.activity.mark_failed(reason.clone(), now);
                warn!(profile = %key, %task, reason = %reason, "transcoding failed");
                fx.publish(
                    SchedulerEvent::TranscodingFailed {
                        profile: key.clone(),
                        task,
                        reason: reason.clone(),
                        diagnostics,
                    }
                    .into(),
                );
                NotifyTrigger::Failed
            }
        };
        fx.push(Effect::StoreActivity(ActivityRecord::Transcoding(
            job.activity.clone(),
        )));
        if let Some(waiter) = self.outcomes.remove(&key)
            && let Err(e) = waiter.resolve(outcome.clone())
        {
            warn!(profile = %key, error = %e, "job outcome already settled");
        }

        for request in self.notifications(&job, trigger, &outcome, documents, emergency) {
            fx.push(Effect::Notify(request));
        }
        self.request_admission(fx);
    }

    /// Fan-out in level order: global, customer, profile, targets, then emergency.
    fn notifications(
        &self,
        job: &ActiveJob,
        trigger: NotifyTrigger,
        outcome: &JobOutcome,
        documents: Vec<Document>,
        emergency: bool,
    ) -> Vec<NotifyRequest> {
        let mut variables = BTreeMap::new();
        variables.insert("customer".to_string(), job.context.key.customer.clone());
        variables.insert("profile".to_string(), job.context.key.profile.clone());
        variables.insert("file".to_string(), job.context.key.file.clone());
        variables.insert("label".to_string(), job.context.label.clone());
        variables.insert("task".to_string(), job.task.to_string());
        variables.insert("input".to_string(), job.params.input_path.clone());
        variables.insert("trigger".to_string(), trigger.to_string());
        if let Some(worker) = &job.activity.worker {
            variables.insert("worker".to_string(), worker.to_string());
        }
        if let JobOutcome::Failed { reason } = outcome {
            variables.insert("error".to_string(), reason.clone());
        }

        let mut specs: Vec<&NotificationSpec> = self
            .global_notifications
            .iter()
            .chain(job.context.notifications.iter())
            .filter(|spec| spec.fires_on(trigger))
            .collect();
        specs.sort_by(|a, b| a.level.cmp(&b.level));

        let request = |level: NotificationLevel, kind: NotificationKind| NotifyRequest {
            label: job.context.label.clone(),
            trigger,
            level,
            profile: job.context.key.clone(),
            kind,
            variables: variables.clone(),
            documents: documents.clone(),
        };
        let mut requests: Vec<NotifyRequest> = specs
            .into_iter()
            .map(|spec| request(spec.level.clone(), spec.kind.clone()))
            .collect();
        if emergency {
            // 宛先は notifier の設定で埋まる
            requests.push(request(
                NotificationLevel::Emergency,
                NotificationKind::Email {
                    recipients: Vec::new(),
                    subject: Some(format!("{} could not be transcoded", job.context.label)),
                },
            ));
        }
        requests
    }
}

/// Hints attached to a failed job.
fn diagnose(job: &ActiveJob, reason: &str, worker: Option<&str>, retries: u32) -> Vec<String> {
    let mut lines = vec![
        format!("profile: {}", job.context.key),
        format!("input: {}", job.params.input_path),
        format!("worker: {}", worker.unwrap_or("none")),
        format!("retries: {retries}"),
    ];
    if job.context.targets.is_empty() {
        lines.push("profile declares no targets".to_string());
    }
    for target in &job.context.targets {
        lines.push(format!("target {} -> {}", target.name, target.output));
    }
    if job.component.is_none() {
        lines.push("no transcoder was ever elected".to_string());
    }
    if reason.contains("timed out") {
        lines.push("a transcoder did not answer in time; check worker load".to_string());
    }
    if worker.is_none() {
        lines.push("no worker was available for this job".to_string());
    }
    lines
}

impl Machine for Scheduler {
    fn handle(&mut self, input: Input, fx: &mut Effects) {
        match input {
            Input::TimerFired {
                key: TimerKey::Admission,
                token,
            } => self.on_admission(token, fx),
            Input::ReportFetched { task, result, .. } => self.on_report(task, result, fx),
            input => {
                let capacity_changed =
                    matches!(input, Input::WorkerAdded(_) | Input::WorkerRemoved(_));
                let mark = fx.mark();
                self.manager.handle(input, fx);
                self.observe(mark, fx);
                if capacity_changed {
                    self.request_admission(fx);
                }
            }
        }
    }

    fn settle(&mut self, fx: &mut Effects) {
        let mark = fx.mark();
        self.manager.settle(fx);
        self.observe(mark, fx);
        // manager の起動完了を待っていた profile を拾う
        if self.manager.state() == ManagerState::Started
            && !self.queue.is_empty()
            && self.free_slots() > 0
        {
            self.request_admission(fx);
        }
    }
}
