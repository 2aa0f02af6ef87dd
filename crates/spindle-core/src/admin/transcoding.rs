//! TranscodingTask - 1 ファイル分の変換ジョブを監督するタスク
//!
//! # ジョブのサブプロトコル
//! ```text
//! pending --(status done|failed)--> waiting_ack --(acknowledged)--> terminated
//! ```
//! 終了ステータスを見たら acknowledge を送り、その結果（失敗はログのみ）を
//! 受けてから `JobFinished` を publish する。

use tracing::{info, warn};

use crate::domain::component::{ComponentKind, ComponentProperties, ComponentSnapshot};
use crate::domain::errors::AdminError;
use crate::domain::events::{JobOutcome, TaskEvent};
use crate::domain::ids::ComponentId;
use crate::domain::mood::Mood;
use crate::domain::profile::{ProfileContext, TranscodingParams};
use crate::domain::state::JobState;
use crate::domain::worker::WorkerName;
use crate::runtime::Effect;

use super::kind::{TaskCtx, TaskKind};

pub const DEFAULT_TRANSCODER_RETRIES: u32 = 2;

const STATUS: &str = "/job-data/status";
const ERROR: &str = "/job-data/error";

fn job_status(component: &ComponentSnapshot) -> Option<&str> {
    component.ui_state.as_ref().and_then(|ui| ui.str_at(STATUS))
}

fn has_failed(component: &ComponentSnapshot) -> bool {
    job_status(component) == Some("failed")
}

pub struct TranscodingTask {
    context: ProfileContext,
    params: TranscodingParams,
    max_retries: u32,
    job: JobState,
    outcome: Option<JobOutcome>,
}

impl TranscodingTask {
    pub fn new(context: ProfileContext, params: TranscodingParams, max_retries: u32) -> Self {
        Self {
            context,
            params,
            max_retries,
            job: JobState::Pending,
            outcome: None,
        }
    }

    pub fn context(&self) -> &ProfileContext {
        &self.context
    }

    pub fn params(&self) -> &TranscodingParams {
        &self.params
    }

    pub fn job_state(&self) -> JobState {
        self.job
    }

    /// Known once the transcoder reported a terminal status.
    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    fn inspect(&mut self, ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
        if self.job != JobState::Pending {
            return;
        }
        let outcome = match job_status(component) {
            Some("done") => JobOutcome::Done,
            Some("failed") => JobOutcome::Failed {
                reason: component
                    .ui_state
                    .as_ref()
                    .and_then(|ui| ui.str_at(ERROR))
                    .unwrap_or("transcoder reported a failure")
                    .to_string(),
            },
            _ => return,
        };

        info!(task = %ctx.task, component = %component.id, ?outcome, "job finished; acknowledging");
        self.job = JobState::WaitingAck;
        self.outcome = Some(outcome);
        ctx.effect(Effect::Acknowledge {
            task: ctx.task,
            component: component.id,
            timeout: ctx.timeouts.acknowledge(),
        });
    }
}

impl TaskKind for TranscodingTask {
    fn component_kind(&self) -> ComponentKind {
        ComponentKind::Transcoder
    }

    fn properties(&self) -> ComponentProperties {
        let targets: Vec<&str> = self.context.targets.iter().map(|t| t.name.as_str()).collect();
        let mut props = ComponentProperties::new()
            .with("kind", "transcoder")
            .with("customer", self.context.key.customer.clone())
            .with("profile", self.context.key.profile.clone())
            .with("file", self.context.key.file.clone())
            .with("input", self.params.input_path.clone())
            .with("targets", targets);
        if !self.params.extra.is_empty() {
            props = props.with("extra", serde_json::Value::Object(self.params.extra.clone()));
        }
        props
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// A sad transcoder still counts when its job failed: the failure is the result.
    fn is_potential(&self, component: &ComponentSnapshot) -> bool {
        match component.mood {
            Mood::Happy => true,
            Mood::Sad => has_failed(component),
            _ => false,
        }
    }

    fn accept_suggested_worker(
        &self,
        _current: Option<&WorkerName>,
        _suggested: Option<&WorkerName>,
        has_active: bool,
    ) -> bool {
        // 実行中のジョブは移動しない
        !has_active
    }

    fn tolerates_sad(&self, component: &ComponentSnapshot) -> bool {
        has_failed(component) || self.job != JobState::Pending
    }

    fn on_elected(&mut self, ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
        self.inspect(ctx, component);
    }

    fn on_restored(&mut self, ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
        self.inspect(ctx, component);
    }

    fn on_ui_state(&mut self, ctx: &mut TaskCtx<'_>, component: &ComponentSnapshot) {
        self.inspect(ctx, component);
    }

    fn on_acknowledged(
        &mut self,
        ctx: &mut TaskCtx<'_>,
        component: ComponentId,
        result: Result<(), AdminError>,
    ) {
        if self.job != JobState::WaitingAck {
            return;
        }
        if let Err(e) = result {
            warn!(task = %ctx.task, %component, error = %e, "acknowledge failed; finishing anyway");
        }
        self.job = JobState::Terminated;
        let Some(outcome) = self.outcome.clone() else {
            return;
        };
        ctx.publish(TaskEvent::JobFinished { component, outcome });
    }
}
