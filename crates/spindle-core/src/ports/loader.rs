//! ComponentLoader port - worker 上に component を起動する

use std::sync::Arc;
use std::time::Duration;

use crate::domain::component::{ComponentKind, ComponentProperties};
use crate::domain::errors::AdminError;
use crate::domain::worker::WorkerName;
use crate::ports::ComponentProxy;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub kind: ComponentKind,
    /// Fresh pending name; unique per attempt.
    pub name: String,
    pub label: String,
    pub properties: ComponentProperties,
    pub worker: Option<WorkerName>,
    pub timeout: Duration,
}

/// ComponentLoader は load 操作
///
/// 時間切れ・拒否はどちらも `AdminError` で返す。
#[async_trait::async_trait]
pub trait ComponentLoader: Send + Sync {
    async fn load_component(
        &self,
        request: LoadRequest,
    ) -> Result<Arc<dyn ComponentProxy>, AdminError>;
}
