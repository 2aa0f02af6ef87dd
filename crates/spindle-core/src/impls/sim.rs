//! Simulated cluster - ワーカーも component もメモリ上で動かす
//!
//! CLI のデモと runtime のテストで使う。
//!
//! # component のライフサイクル
//! 1. load されると `waking`
//! 2. `happy_after_ms` 後に `happy`
//! 3. monitor: 受信ディレクトリのファイル一覧を UI state (`pending-files`) に出す
//! 4. transcoder: `job_duration_ms` 後に `/job-data/status` を `done` か `failed` にする。
//!    失敗したら `sad` になる

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::component::{ComponentKind, ComponentProperties, UiState};
use crate::domain::errors::AdminError;
use crate::domain::events::IncomingFile;
use crate::domain::ids::ComponentId;
use crate::domain::mood::Mood;
use crate::domain::notification::Document;
use crate::domain::worker::{WorkerInfo, WorkerName};
use crate::ports::{ComponentLoader, ComponentProxy, LoadRequest};

/// How simulated components behave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimBehavior {
    pub load_delay_ms: u64,
    pub happy_after_ms: u64,
    pub job_duration_ms: u64,
    /// Transcoding jobs of these files end with `failed`.
    pub failing_files: Vec<String>,
    /// Loads of transcoders for these files are refused.
    pub refused_files: Vec<String>,
    /// Files waiting in each monitored directory.
    pub inbox: BTreeMap<String, Vec<IncomingFile>>,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            load_delay_ms: 100,
            happy_after_ms: 200,
            job_duration_ms: 1_000,
            failing_files: Vec::new(),
            refused_files: Vec::new(),
            inbox: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub workers: Vec<WorkerInfo>,
    pub behavior: SimBehavior,
}

#[derive(Debug, Default)]
struct SimState {
    acknowledged: bool,
    deleted: bool,
    connection_lost: bool,
    stop_calls: u32,
    /// Force stops that fail before one succeeds.
    failing_stops: u32,
    report: Option<Document>,
}

/// An in-memory component.
pub struct SimComponent {
    id: ComponentId,
    name: String,
    kind: ComponentKind,
    worker: Option<WorkerName>,
    properties: ComponentProperties,
    mood: watch::Sender<Mood>,
    ui_state: watch::Sender<Option<UiState>>,
    state: Mutex<SimState>,
}

impl SimComponent {
    pub fn new(
        kind: ComponentKind,
        name: impl Into<String>,
        worker: Option<WorkerName>,
        properties: ComponentProperties,
    ) -> Arc<Self> {
        let (mood, _) = watch::channel(Mood::Waking);
        let (ui_state, _) = watch::channel(None);
        Arc::new(Self {
            id: ComponentId::generate(),
            name: name.into(),
            kind,
            worker,
            properties,
            mood,
            ui_state,
            state: Mutex::new(SimState::default()),
        })
    }

    pub fn set_mood(&self, mood: Mood) {
        self.mood.send_replace(mood);
    }

    pub fn set_ui_state(&self, value: serde_json::Value) {
        self.ui_state.send_replace(Some(UiState::new(value)));
    }

    /// Every later remote call fails with `ConnectionLost`.
    pub fn lose_connection(&self) {
        self.state.lock().connection_lost = true;
        self.set_mood(Mood::Lost);
    }

    pub fn fail_stops(&self, times: u32) {
        self.state.lock().failing_stops = times;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state.lock().acknowledged
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    pub fn stop_calls(&self) -> u32 {
        self.state.lock().stop_calls
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    fn check_connection(&self) -> Result<(), AdminError> {
        if self.state.lock().connection_lost {
            return Err(AdminError::ConnectionLost(self.name.clone()));
        }
        Ok(())
    }

    fn finish_job(&self, failed: bool) {
        let status = if failed { "failed" } else { "done" };
        let mut job = json!({ "status": status });
        if failed {
            job["error"] = json!("simulated encoder failure");
        }
        self.state.lock().report = Some(Document {
            label: "job report".into(),
            mime_type: "application/json".into(),
            body: json!({ "component": self.name, "status": status }).to_string(),
        });
        self.set_ui_state(json!({ "job-data": job }));
        if failed {
            self.set_mood(Mood::Sad);
        }
    }
}

#[async_trait::async_trait]
impl ComponentProxy for SimComponent {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn worker(&self) -> Option<WorkerName> {
        self.worker.clone()
    }

    fn mood(&self) -> Mood {
        *self.mood.borrow()
    }

    fn watch_mood(&self) -> watch::Receiver<Mood> {
        self.mood.subscribe()
    }

    fn watch_ui_state(&self) -> watch::Receiver<Option<UiState>> {
        self.ui_state.subscribe()
    }

    async fn wait_happy(&self, timeout: Duration) -> Result<(), AdminError> {
        self.check_connection()?;
        let mut rx = self.mood.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|m| *m == Mood::Happy)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(AdminError::ConnectionLost(self.name.clone())),
            Err(_) => Err(AdminError::timeout(format!("{} to become happy", self.name), timeout)),
        }
    }

    async fn ui_state(&self, timeout: Duration) -> Result<UiState, AdminError> {
        self.check_connection()?;
        let mut rx = self.ui_state.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(state)) => state
                .clone()
                .ok_or_else(|| AdminError::Remote(format!("{} has no UI state", self.name))),
            Ok(Err(_)) => Err(AdminError::ConnectionLost(self.name.clone())),
            Err(_) => Err(AdminError::timeout(format!("UI state of {}", self.name), timeout)),
        }
    }

    async fn properties(&self) -> Result<ComponentProperties, AdminError> {
        self.check_connection()?;
        Ok(self.properties.clone())
    }

    async fn force_stop(&self) -> Result<(), AdminError> {
        self.check_connection()?;
        {
            let mut state = self.state.lock();
            state.stop_calls += 1;
            if state.failing_stops > 0 {
                state.failing_stops -= 1;
                return Err(AdminError::Remote(format!("{} refused to stop", self.name)));
            }
        }
        self.set_mood(Mood::Sleeping);
        Ok(())
    }

    async fn force_delete(&self) -> Result<(), AdminError> {
        self.check_connection()?;
        self.state.lock().deleted = true;
        Ok(())
    }

    async fn acknowledge(&self) -> Result<(), AdminError> {
        self.check_connection()?;
        self.state.lock().acknowledged = true;
        Ok(())
    }

    async fn job_report(&self) -> Result<Document, AdminError> {
        self.check_connection()?;
        self.state
            .lock()
            .report
            .clone()
            .ok_or_else(|| AdminError::Remote(format!("{} has no report yet", self.name)))
    }
}

/// Loads [`SimComponent`]s onto simulated workers.
pub struct SimLoader {
    behavior: SimBehavior,
    workers: Vec<WorkerName>,
    loaded: Mutex<Vec<Arc<SimComponent>>>,
}

impl SimLoader {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            behavior: config.behavior.clone(),
            workers: config.workers.iter().map(|w| w.name.clone()).collect(),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Everything loaded so far, deleted or not.
    pub fn loaded(&self) -> Vec<Arc<SimComponent>> {
        self.loaded.lock().clone()
    }

    pub fn live(&self) -> Vec<Arc<SimComponent>> {
        self.loaded
            .lock()
            .iter()
            .filter(|c| !c.is_deleted())
            .cloned()
            .collect()
    }

    /// Worker with the fewest live components.
    fn least_loaded(&self) -> Option<WorkerName> {
        let mut counts: HashMap<&WorkerName, usize> =
            self.workers.iter().map(|w| (w, 0)).collect();
        let loaded = self.loaded.lock();
        for component in loaded.iter().filter(|c| !c.is_deleted()) {
            if let Some(w) = &component.worker
                && let Some(count) = counts.get_mut(w)
            {
                *count += 1;
            }
        }
        self.workers
            .iter()
            .min_by_key(|w| counts.get(w).copied().unwrap_or(0))
            .cloned()
    }
}

#[async_trait::async_trait]
impl ComponentLoader for SimLoader {
    async fn load_component(
        &self,
        request: LoadRequest,
    ) -> Result<Arc<dyn ComponentProxy>, AdminError> {
        tokio::time::sleep(Duration::from_millis(self.behavior.load_delay_ms)).await;

        let file = request
            .properties
            .get("file")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if request.kind == ComponentKind::Transcoder
            && file
                .as_ref()
                .is_some_and(|f| self.behavior.refused_files.contains(f))
        {
            return Err(AdminError::Rejected(format!("worker refused {}", request.name)));
        }

        let worker = match request.worker {
            Some(worker) if self.workers.contains(&worker) => worker,
            Some(worker) => return Err(AdminError::Orphan(format!("unknown worker {worker}"))),
            None => self
                .least_loaded()
                .ok_or_else(|| AdminError::Orphan(request.kind.to_string()))?,
        };

        let component = SimComponent::new(
            request.kind,
            request.name,
            Some(worker.clone()),
            request.properties,
        );
        debug!(component = %component.id, name = %component.name, %worker, "simulated load");
        self.loaded.lock().push(Arc::clone(&component));
        tokio::spawn(live(Arc::clone(&component), self.behavior.clone(), file));
        Ok(component)
    }
}

async fn live(component: Arc<SimComponent>, behavior: SimBehavior, file: Option<String>) {
    tokio::time::sleep(Duration::from_millis(behavior.happy_after_ms)).await;
    if component.is_deleted() || component.state.lock().connection_lost {
        return;
    }
    component.set_mood(Mood::Happy);

    match component.kind {
        ComponentKind::Monitor => {
            let files = component
                .property("directory")
                .and_then(|dir| behavior.inbox.get(dir))
                .cloned()
                .unwrap_or_default();
            component.set_ui_state(json!({ "pending-files": files }));
        }
        ComponentKind::Transcoder => {
            component.set_ui_state(json!({ "job-data": { "status": "running" } }));
            tokio::time::sleep(Duration::from_millis(behavior.job_duration_ms)).await;
            if component.is_deleted() || component.state.lock().connection_lost {
                return;
            }
            let failed = file.is_some_and(|f| behavior.failing_files.contains(&f));
            component.finish_job(failed);
        }
    }
}
