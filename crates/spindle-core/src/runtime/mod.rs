//! Runtime - 状態機械を動かす tokio ループ
//!
//! # 役割
//! - `Command` を 1 つずつ受け取り、状態機械に渡す（状態機械は常にこのループだけが触る）
//! - 状態機械が積んだ `Effect` を実行する。リモート呼び出しとタイマーは spawn し、
//!   完了を `Input` としてループに戻す
//! - component のレジストリ（`ComponentId → Arc<dyn ComponentProxy>`）を持ち、
//!   mood / UI state の変化を watch channel から転送する
//! - イベントは broadcast で配信、停止は watch フラグ
//!
//! # 順序
//! 同じ component の UI state と mood が同時に変わったら UI state を先に転送する。
//! sad の判断が UI state（ジョブの失敗ステータス）に依存するため。

mod effects;

pub use effects::{Effect, Effects, Input, Machine, TaskTimer, TimerKey, UiPurpose};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::activity::{ActivityRecord, ActivityState, NotificationActivity};
use crate::domain::component::ComponentSnapshot;
use crate::domain::errors::AdminError;
use crate::domain::events::ServiceEvent;
use crate::domain::ids::{ComponentId, TaskId};
use crate::ports::{ActivityStore, Clock, ComponentLoader, ComponentProxy, IdGenerator, Notifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Force stop + delete attempts before giving up.
    pub force_stop_attempts: u32,
    pub force_stop_backoff_ms: u64,
    pub notify_timeout_ms: u64,
    pub event_capacity: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            force_stop_attempts: 3,
            force_stop_backoff_ms: 500,
            notify_timeout_ms: 30_000,
            event_capacity: 1024,
        }
    }
}

impl RuntimeSettings {
    pub fn force_stop_backoff(&self) -> Duration {
        Duration::from_millis(self.force_stop_backoff_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

/// Collaborators the runtime calls on behalf of the machine.
#[derive(Clone)]
pub struct Ports {
    pub loader: Arc<dyn ComponentLoader>,
    pub activities: Arc<dyn ActivityStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

type Call<M> = Box<dyn FnOnce(&mut M, &mut Effects) + Send>;

enum Command<M> {
    Input(Input),
    Call(Call<M>),
    Register(Arc<dyn ComponentProxy>),
    Unregister(ComponentId),
    Loaded {
        task: TaskId,
        name: String,
        result: Result<Arc<dyn ComponentProxy>, AdminError>,
    },
    TornDown {
        task: Option<TaskId>,
        component: ComponentId,
        result: Result<(), AdminError>,
    },
}

struct Registered {
    proxy: Arc<dyn ComponentProxy>,
    forwarder: JoinHandle<()>,
}

struct Timer {
    token: u64,
    handle: JoinHandle<()>,
}

pub struct Runtime<M: Machine> {
    machine: M,
    ports: Ports,
    settings: RuntimeSettings,
    components: HashMap<ComponentId, Registered>,
    timers: HashMap<TimerKey, Timer>,
    tx: mpsc::UnboundedSender<Command<M>>,
    rx: mpsc::UnboundedReceiver<Command<M>>,
    events: broadcast::Sender<ServiceEvent>,
    shutdown: watch::Receiver<bool>,
}

/// Cloneable access to a running [`Runtime`].
pub struct RuntimeHandle<M> {
    tx: mpsc::UnboundedSender<Command<M>>,
    events: broadcast::Sender<ServiceEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<M> Clone for RuntimeHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            events: self.events.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<M: Machine> RuntimeHandle<M> {
    /// Returns `false` once the runtime is gone.
    pub fn send(&self, input: Input) -> bool {
        self.tx.send(Command::Input(input)).is_ok()
    }

    /// Run `f` on the machine inside the loop; its effects are executed afterwards.
    pub async fn call<R, F>(&self, f: F) -> Result<R, AdminError>
    where
        R: Send + 'static,
        F: FnOnce(&mut M, &mut Effects) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let call: Call<M> = Box::new(move |machine, fx| {
            let _ = reply.send(f(machine, fx));
        });
        self.tx
            .send(Command::Call(call))
            .map_err(|_| AdminError::Remote("runtime stopped".into()))?;
        rx.await
            .map_err(|_| AdminError::Remote("runtime stopped before replying".into()))
    }

    /// A remote component appeared.
    pub fn add_component(&self, proxy: Arc<dyn ComponentProxy>) -> bool {
        self.tx.send(Command::Register(proxy)).is_ok()
    }

    pub fn remove_component(&self, component: ComponentId) -> bool {
        self.tx.send(Command::Unregister(component)).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        // 受信側がすでに居なくても構わない
        let _ = self.shutdown.send(true);
    }
}

impl<M: Machine> Runtime<M> {
    pub fn new(machine: M, ports: Ports, settings: RuntimeSettings) -> (Self, RuntimeHandle<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = RuntimeHandle {
            tx: tx.clone(),
            events: events.clone(),
            shutdown: Arc::new(shutdown_tx),
        };
        let runtime = Self {
            machine,
            ports,
            settings,
            components: HashMap::new(),
            timers: HashMap::new(),
            tx,
            rx,
            events,
            shutdown: shutdown_rx,
        };
        (runtime, handle)
    }

    /// Run until shutdown. Returns the machine for inspection.
    pub async fn run(mut self) -> M {
        info!("runtime started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let command = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                command = self.rx.recv() => command,
            };
            let Some(command) = command else {
                break;
            };
            self.step(command);
        }

        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        for (_, registered) in self.components.drain() {
            registered.forwarder.abort();
        }
        info!("runtime stopped");
        self.machine
    }

    fn step(&mut self, command: Command<M>) {
        let mut fx = Effects::new();
        match command {
            Command::Input(input) => {
                if let Input::TimerFired { key, token } = &input {
                    self.forget_timer(*key, *token);
                }
                self.machine.handle(input, &mut fx);
            }
            Command::Call(call) => call(&mut self.machine, &mut fx),
            Command::Register(proxy) => {
                let snapshot = self.register(proxy);
                debug!(component = %snapshot.id, name = %snapshot.name, "component registered");
                self.machine.handle(Input::ComponentAdded(snapshot), &mut fx);
            }
            Command::Unregister(component) => {
                self.unregister(component);
                self.machine
                    .handle(Input::ComponentRemoved(component), &mut fx);
            }
            Command::Loaded { task, name, result } => {
                let result = result.map(|proxy| self.register(proxy));
                self.machine
                    .handle(Input::LoadFinished { task, name, result }, &mut fx);
            }
            Command::TornDown {
                task,
                component,
                result,
            } => {
                let gone = match &result {
                    Ok(()) => true,
                    Err(e) => e.is_connection_lost(),
                };
                if gone {
                    self.unregister(component);
                }
                self.machine.handle(
                    Input::Stopped {
                        task,
                        component,
                        result,
                    },
                    &mut fx,
                );
            }
        }
        self.machine.settle(&mut fx);
        for effect in fx {
            self.execute(effect);
        }
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Subscribe before taking the snapshot so no change is missed.
    fn register(&mut self, proxy: Arc<dyn ComponentProxy>) -> ComponentSnapshot {
        let id = proxy.id();
        let mut mood = proxy.watch_mood();
        let mut ui = proxy.watch_ui_state();
        let snapshot = proxy.snapshot();

        let tx = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let input = tokio::select! {
                    biased;
                    changed = ui.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(ui_state) = ui.borrow_and_update().clone() else {
                            continue;
                        };
                        Input::UiStateChanged { component: id, ui_state }
                    }
                    changed = mood.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let mood = *mood.borrow_and_update();
                        Input::MoodChanged { component: id, mood }
                    }
                };
                if tx.send(Command::Input(input)).is_err() {
                    break;
                }
            }
        });

        if let Some(old) = self.components.insert(id, Registered { proxy, forwarder }) {
            old.forwarder.abort();
        }
        snapshot
    }

    fn unregister(&mut self, component: ComponentId) {
        if let Some(registered) = self.components.remove(&component) {
            registered.forwarder.abort();
        }
    }

    fn proxy(&self, component: ComponentId) -> Result<Arc<dyn ComponentProxy>, AdminError> {
        self.components
            .get(&component)
            .map(|r| Arc::clone(&r.proxy))
            .ok_or_else(|| AdminError::Remote(format!("component {component} is not registered")))
    }

    // =========================================================================
    // Effects
    // =========================================================================

    fn spawn_input<F>(&self, fut: F)
    where
        F: Future<Output = Input> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let input = fut.await;
            let _ = tx.send(Command::Input(input));
        });
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Load { task, request } => {
                let loader = Arc::clone(&self.ports.loader);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let name = request.name.clone();
                    let timeout = request.timeout;
                    let result = tokio::time::timeout(timeout, loader.load_component(request))
                        .await
                        .unwrap_or_else(|_| Err(AdminError::timeout(format!("load of {name}"), timeout)));
                    let _ = tx.send(Command::Loaded { task, name, result });
                });
            }
            Effect::WaitHappy {
                task,
                component,
                timeout,
            } => {
                let proxy = self.proxy(component);
                self.spawn_input(async move {
                    let result = match proxy {
                        Ok(proxy) => proxy.wait_happy(timeout).await,
                        Err(e) => Err(e),
                    };
                    Input::HappyFinished {
                        task,
                        component,
                        result,
                    }
                });
            }
            Effect::FetchUiState {
                task,
                component,
                purpose,
                timeout,
            } => {
                let proxy = self.proxy(component);
                self.spawn_input(async move {
                    let result = match proxy {
                        Ok(proxy) => proxy.ui_state(timeout).await,
                        Err(e) => Err(e),
                    };
                    Input::UiStateFetched {
                        task,
                        component,
                        purpose,
                        result,
                    }
                });
            }
            Effect::Stop { task, component } => {
                let Ok(proxy) = self.proxy(component) else {
                    // もう居ない
                    let _ = self.tx.send(Command::TornDown {
                        task,
                        component,
                        result: Ok(()),
                    });
                    return;
                };
                let attempts = self.settings.force_stop_attempts.max(1);
                let backoff = self.settings.force_stop_backoff();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = tear_down(proxy, attempts, backoff).await;
                    let _ = tx.send(Command::TornDown {
                        task,
                        component,
                        result,
                    });
                });
            }
            Effect::Acknowledge {
                task,
                component,
                timeout,
            } => {
                let proxy = self.proxy(component);
                self.spawn_input(async move {
                    let result = match proxy {
                        Ok(proxy) => bounded(timeout, "acknowledge", proxy.acknowledge()).await,
                        Err(e) => Err(e),
                    };
                    Input::Acknowledged {
                        task,
                        component,
                        result,
                    }
                });
            }
            Effect::FetchProperties { component, timeout } => {
                let proxy = self.proxy(component);
                self.spawn_input(async move {
                    let result = match proxy {
                        Ok(proxy) => bounded(timeout, "properties", proxy.properties()).await,
                        Err(e) => Err(e),
                    };
                    Input::PropertiesFetched { component, result }
                });
            }
            Effect::FetchReport {
                task,
                component,
                timeout,
            } => {
                let proxy = self.proxy(component);
                self.spawn_input(async move {
                    let result = match proxy {
                        Ok(proxy) => bounded(timeout, "job report", proxy.job_report()).await,
                        Err(e) => Err(e),
                    };
                    Input::ReportFetched {
                        task,
                        component,
                        result,
                    }
                });
            }
            Effect::Schedule { key, token, delay } => {
                let tx = self.tx.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Command::Input(Input::TimerFired { key, token }));
                });
                if let Some(old) = self.timers.insert(key, Timer { token, handle }) {
                    old.handle.abort();
                }
            }
            Effect::Cancel { key } => {
                if let Some(timer) = self.timers.remove(&key) {
                    timer.handle.abort();
                }
            }
            Effect::StoreActivity(record) => {
                let store = Arc::clone(&self.ports.activities);
                tokio::spawn(store_activity(store, record));
            }
            Effect::DeleteActivity(id) => {
                let store = Arc::clone(&self.ports.activities);
                tokio::spawn(async move {
                    if let Err(e) = store.delete(id).await {
                        warn!(activity = %id, error = %e, "could not delete activity");
                    }
                });
            }
            Effect::Notify(request) => {
                let notifier = Arc::clone(&self.ports.notifier);
                let store = Arc::clone(&self.ports.activities);
                let clock = Arc::clone(&self.ports.clock);
                let id = self.ports.ids.activity_id();
                let timeout = self.settings.notify_timeout();
                tokio::spawn(async move {
                    let label = request.label.clone();
                    let trigger = request.trigger;
                    let kind = request.kind.clone();
                    let result = bounded(timeout, "notification", notifier.notify(request)).await;

                    // 通知の失敗は呼び出し側に伝えない
                    let (state, error) = match result {
                        Ok(()) => (ActivityState::Done, None),
                        Err(e) => {
                            warn!(%label, %trigger, error = %e, "notification failed");
                            (ActivityState::Failed, Some(e.to_string()))
                        }
                    };
                    let record = ActivityRecord::Notification(NotificationActivity {
                        id,
                        label,
                        trigger,
                        kind,
                        state,
                        created_at: clock.now(),
                        error,
                    });
                    store_activity(store, record).await;
                });
            }
            Effect::Publish(event) => {
                // 購読者がいなくてもよい
                let _ = self.events.send(event);
            }
        }
    }

    fn forget_timer(&mut self, key: TimerKey, token: u64) {
        if self.timers.get(&key).is_some_and(|t| t.token == token) {
            self.timers.remove(&key);
        }
    }
}

async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T, AdminError>
where
    F: Future<Output = Result<T, AdminError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(AdminError::timeout(what, timeout)))
}

/// Force stop then force delete, retried. A lost connection ends it at once.
async fn tear_down(
    proxy: Arc<dyn ComponentProxy>,
    attempts: u32,
    backoff: Duration,
) -> Result<(), AdminError> {
    let component = proxy.id();
    let mut last = String::new();
    for attempt in 1..=attempts {
        let result = match proxy.force_stop().await {
            Ok(()) => proxy.force_delete().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_connection_lost() => return Err(e),
            Err(e) => {
                debug!(%component, attempt, error = %e, "force deletion attempt failed");
                last = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(AdminError::ForceDeletionFailed {
        component,
        attempts,
        last,
    })
}

/// A failed store resets the record.
async fn store_activity(store: Arc<dyn ActivityStore>, record: ActivityRecord) {
    let id = record.id();
    if let Err(e) = store.store(record).await {
        warn!(activity = %id, error = %e, "could not store activity; resetting");
        if let Err(e) = store.reset(id).await {
            warn!(activity = %id, error = %e, "could not reset activity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminTask, MonitorSpec, MonitorTask, TaskManager, TaskSettings};
    use crate::domain::component::{ComponentKind, ComponentProperties};
    use crate::domain::events::{IncomingFile, TaskEvent};
    use crate::domain::mood::Mood;
    use crate::domain::notification::{NotificationKind, NotificationLevel, NotifyRequest, NotifyTrigger};
    use crate::domain::profile::ProfileKey;
    use crate::domain::worker::WorkerInfo;
    use crate::impls::{InMemoryActivityStore, LogNotifier, NotifierConfig, SimBehavior, SimComponent, SimConfig, SimLoader};
    use crate::ports::{SystemClock, UlidGenerator};
    use serde_json::json;
    use std::collections::BTreeMap;

    /// Records every input it sees.
    #[derive(Default)]
    struct Recorder {
        inputs: Vec<Input>,
    }

    impl Machine for Recorder {
        fn handle(&mut self, input: Input, _fx: &mut Effects) {
            self.inputs.push(input);
        }
    }

    struct Fixture {
        loader: Arc<SimLoader>,
        store: Arc<InMemoryActivityStore>,
        ports: Ports,
    }

    fn fixture(sim: SimConfig) -> Fixture {
        let loader = Arc::new(SimLoader::new(&sim));
        let store = Arc::new(InMemoryActivityStore::new());
        let ports = Ports {
            loader: loader.clone(),
            activities: store.clone(),
            notifier: Arc::new(LogNotifier::new(NotifierConfig::default())),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        };
        Fixture {
            loader,
            store,
            ports,
        }
    }

    fn component() -> Arc<SimComponent> {
        SimComponent::new(
            ComponentKind::Transcoder,
            "transcoder-a",
            None,
            ComponentProperties::new().with("file", "a.mov"),
        )
    }

    fn settle() -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn ui_state_is_forwarded_before_mood() {
        let f = fixture(SimConfig::default());
        let (runtime, handle) = Runtime::new(Recorder::default(), f.ports, RuntimeSettings::default());
        let join = tokio::spawn(runtime.run());

        let c = component();
        handle.add_component(c.clone());
        settle().await;
        c.set_mood(Mood::Sad);
        c.set_ui_state(json!({ "job-data": { "status": "failed" } }));
        settle().await;

        handle.shutdown();
        let recorder = join.await.unwrap();
        assert!(matches!(&recorder.inputs[0], Input::ComponentAdded(s) if s.id == c.id()));
        assert!(matches!(&recorder.inputs[1], Input::UiStateChanged { component, .. } if *component == c.id()));
        assert_eq!(
            recorder.inputs[2],
            Input::MoodChanged {
                component: c.id(),
                mood: Mood::Sad
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_retries_until_the_component_is_gone() {
        let f = fixture(SimConfig::default());
        let (runtime, handle) = Runtime::new(Recorder::default(), f.ports, RuntimeSettings::default());
        let join = tokio::spawn(runtime.run());

        let c = component();
        c.fail_stops(1);
        handle.add_component(c.clone());
        let id = c.id();
        handle
            .call(move |_, fx| fx.push(Effect::Stop { task: None, component: id }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        handle.shutdown();
        let recorder = join.await.unwrap();
        assert_eq!(c.stop_calls(), 2);
        assert!(c.is_deleted());
        assert!(recorder.inputs.contains(&Input::Stopped {
            task: None,
            component: id,
            result: Ok(())
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_gives_up_after_the_configured_attempts() {
        let f = fixture(SimConfig::default());
        let (runtime, handle) = Runtime::new(Recorder::default(), f.ports, RuntimeSettings::default());
        let join = tokio::spawn(runtime.run());

        let c = component();
        c.fail_stops(10);
        handle.add_component(c.clone());
        let id = c.id();
        handle
            .call(move |_, fx| fx.push(Effect::Stop { task: None, component: id }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        handle.shutdown();
        let recorder = join.await.unwrap();
        assert_eq!(c.stop_calls(), 3);
        let failed = recorder.inputs.iter().any(|i| {
            matches!(
                i,
                Input::Stopped {
                    result: Err(AdminError::ForceDeletionFailed { attempts: 3, .. }),
                    ..
                }
            )
        });
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_timer() {
        let f = fixture(SimConfig::default());
        let (runtime, handle) = Runtime::new(Recorder::default(), f.ports, RuntimeSettings::default());
        let join = tokio::spawn(runtime.run());

        handle
            .call(|_, fx| fx.schedule(TimerKey::Admission, 1, Duration::from_secs(1)))
            .await
            .unwrap();
        handle
            .call(|_, fx| fx.schedule(TimerKey::Admission, 2, Duration::from_secs(3)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        handle.shutdown();
        let recorder = join.await.unwrap();
        assert_eq!(
            recorder.inputs,
            vec![Input::TimerFired {
                key: TimerKey::Admission,
                token: 2
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_notification_is_recorded_not_raised() {
        let f = fixture(SimConfig::default());
        let store = f.store.clone();
        let (runtime, handle) = Runtime::new(Recorder::default(), f.ports, RuntimeSettings::default());
        let join = tokio::spawn(runtime.run());

        let request = NotifyRequest {
            label: "acme/hd/a.mov".into(),
            trigger: NotifyTrigger::Failed,
            level: NotificationLevel::Emergency,
            profile: ProfileKey::new("acme", "hd", "a.mov"),
            kind: NotificationKind::Email {
                recipients: vec![],
                subject: None,
            },
            variables: BTreeMap::new(),
            documents: vec![],
        };
        handle
            .call(move |_, fx| fx.push(Effect::Notify(request)))
            .await
            .unwrap();
        settle().await;

        handle.shutdown();
        join.await.unwrap();
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            &records[0],
            ActivityRecord::Notification(n) if n.state == ActivityState::Failed && n.error.is_some()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_files_from_a_simulated_cluster() {
        let file = IncomingFile {
            customer: "acme".into(),
            profile: "hd".into(),
            file: "a.mov".into(),
        };
        let sim = SimConfig {
            workers: vec![WorkerInfo::new("w1", 2)],
            behavior: SimBehavior {
                inbox: BTreeMap::from([("/in".to_string(), vec![file.clone()])]),
                ..SimBehavior::default()
            },
        };
        let f = fixture(sim);
        let loader = f.loader.clone();
        let ids = f.ports.ids.clone();
        let manager: TaskManager<MonitorTask> =
            TaskManager::new(ComponentKind::Monitor, Default::default());
        let (runtime, handle) = Runtime::new(manager, f.ports, RuntimeSettings::default());
        let mut events = handle.subscribe();
        let join = tokio::spawn(runtime.run());

        handle.send(Input::WorkerAdded(WorkerInfo::new("w1", 2)));
        handle
            .call(move |m, fx| {
                let spec = MonitorSpec {
                    name: "inbox".into(),
                    directory: "/in".into(),
                    worker: None,
                };
                let task = AdminTask::new(
                    ids.task_id(),
                    "inbox",
                    MonitorTask::new(spec, 3),
                    TaskSettings::default(),
                    ids,
                );
                m.add_task(task, fx).unwrap();
                m.start(false, fx).unwrap();
            })
            .await
            .unwrap();

        let files = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Ok(ServiceEvent::Task {
                        event: TaskEvent::FilesDiscovered { files },
                        ..
                    }) => return files,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream broke: {e}"),
                }
            }
        })
        .await
        .unwrap();

        handle.shutdown();
        let manager = join.await.unwrap();
        assert_eq!(files, vec![file]);
        assert_eq!(loader.live().len(), 1);
        assert!(manager.tasks().all(|t| t.active().is_some()));
    }
}
