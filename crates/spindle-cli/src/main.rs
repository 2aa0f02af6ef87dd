use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, sleep_until};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spindle_core::config::AdminConfig;
use spindle_core::domain::{SchedulerEvent, ServiceEvent, TaskEvent};
use spindle_core::impls::{InMemoryActivityStore, LogNotifier, SimLoader};
use spindle_core::ports::{SystemClock, UlidGenerator};
use spindle_core::runtime::{Input, Ports, Runtime};
use spindle_core::service::AdminService;

/// 全ジョブが終わらなくてもここで打ち切る
const DEADLINE: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("spindle.json"));
    let config = match AdminConfig::load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "could not load configuration");
            std::process::exit(2);
        }
    };
    info!(path = %path.display(), workers = config.cluster.workers.len(), "configuration loaded");

    // (A) ports をシミュレーションで用意
    let ids = Arc::new(UlidGenerator::new(SystemClock));
    let ports = Ports {
        loader: Arc::new(SimLoader::new(&config.cluster)),
        activities: Arc::new(InMemoryActivityStore::new()),
        notifier: Arc::new(LogNotifier::new(config.notifier.clone())),
        clock: Arc::new(SystemClock),
        ids: ids.clone(),
    };

    // (B) service を runtime に載せる
    let service = AdminService::new(&config, ids, Arc::new(SystemClock));
    let (runtime, handle) = Runtime::new(service, ports, config.runtime.clone());
    let mut events = handle.subscribe();
    let driver = tokio::spawn(runtime.run());

    // (C) worker を通知して起動
    for worker in &config.cluster.workers {
        handle.send(Input::WorkerAdded(worker.clone()));
    }
    match handle.call(|service, fx| service.start(false, fx)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) | Err(e) => {
            error!(error = %e, "could not start the admin service");
            handle.shutdown();
            std::process::exit(1);
        }
    }

    // (D) キューが空になるか期限まで、イベントを表示
    let deadline = Instant::now() + DEADLINE;
    let mut finished_any = false;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                warn!("deadline reached before the queue drained");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if matches!(
                        event,
                        ServiceEvent::Scheduler(
                            SchedulerEvent::TranscodingDone { .. } | SchedulerEvent::TranscodingFailed { .. }
                        )
                    ) {
                        finished_any = true;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        if finished_any
            && let Ok(true) = handle.call(|service, _| service.is_drained()).await
        {
            info!("queue drained");
            break;
        }
    }

    // (E) 集計を表示して終了
    let counts = handle.call(|service, _| service.counts()).await;
    handle.shutdown();
    let _ = driver.await;
    match counts {
        Ok(counts) => println!(
            "done={} failed={} active={} queued={}",
            counts.done, counts.failed, counts.active, counts.queued
        ),
        Err(e) => error!(error = %e, "could not read final counts"),
    }
}

fn print_event(event: &ServiceEvent) {
    match event {
        ServiceEvent::Scheduler(event) => println!("scheduler: {}", render(event)),
        ServiceEvent::Manager { kind, state } => println!("{kind} manager: {state:?}"),
        ServiceEvent::Task { label, event, .. } => match event {
            TaskEvent::StateChanged { .. } => {}
            event => println!("{label}: {}", render(event)),
        },
    }
}

fn render<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unprintable: {e}>"))
}
