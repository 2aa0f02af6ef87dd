//! Admin - タスクの監督
//!
//! - **task**: 汎用の Admin Task 状態機械（選出・retry・hold）
//! - **kind**: タスク種別ごとのフック（TaskKind）
//! - **manager**: タスク群と component の振り分け、balancer の所有
//! - **monitor** / **transcoding**: 具体的なタスク種別
//! - **policy**: retry の backoff とタイムアウト

pub mod kind;
pub mod manager;
pub mod monitor;
pub mod policy;
pub mod task;
pub mod transcoding;

use std::future::Future;
use std::pin::Pin;

use crate::domain::errors::AdminError;

pub use kind::{TaskCtx, TaskKind};
pub use manager::{ManagerSettings, TaskManager};
pub use monitor::{MonitorSpec, MonitorTask};
pub use policy::{RetryPolicy, TaskTimeouts};
pub use task::{AdminTask, Election, TaskSettings};
pub use transcoding::TranscodingTask;

/// Future handed out by admin objects; `'static`, never borrows the machine.
pub type AdminFuture<T> = Pin<Box<dyn Future<Output = Result<T, AdminError>> + Send>>;
