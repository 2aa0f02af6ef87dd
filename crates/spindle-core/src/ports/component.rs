//! ComponentProxy port - リモート component への窓口
//!
//! 状態機械は proxy を直接触らない。runtime が `ComponentId → Arc<dyn ComponentProxy>`
//! のレジストリを持ち、Effect を実行するときだけ呼び出す。

use std::time::Duration;

use tokio::sync::watch;

use crate::domain::component::{ComponentKind, ComponentProperties, ComponentSnapshot, UiState};
use crate::domain::errors::AdminError;
use crate::domain::ids::ComponentId;
use crate::domain::mood::Mood;
use crate::domain::notification::Document;
use crate::domain::worker::WorkerName;

/// ComponentProxy はリモート component の capability set
///
/// # エラー
/// - 待ちが時間切れ → `AdminError::Timeout`
/// - 接続断 → `AdminError::ConnectionLost`（強制停止はこれを「もう居ない」とみなす）
#[async_trait::async_trait]
pub trait ComponentProxy: Send + Sync {
    fn id(&self) -> ComponentId;

    fn name(&self) -> String;

    fn kind(&self) -> ComponentKind;

    fn worker(&self) -> Option<WorkerName>;

    fn mood(&self) -> Mood;

    /// Mood changes, forwarded to the machine as inputs.
    fn watch_mood(&self) -> watch::Receiver<Mood>;

    fn watch_ui_state(&self) -> watch::Receiver<Option<UiState>>;

    async fn wait_happy(&self, timeout: Duration) -> Result<(), AdminError>;

    async fn ui_state(&self, timeout: Duration) -> Result<UiState, AdminError>;

    async fn properties(&self) -> Result<ComponentProperties, AdminError>;

    async fn force_stop(&self) -> Result<(), AdminError>;

    async fn force_delete(&self) -> Result<(), AdminError>;

    /// Tell a transcoder its terminal job state was seen.
    async fn acknowledge(&self) -> Result<(), AdminError>;

    async fn job_report(&self) -> Result<Document, AdminError>;

    fn snapshot(&self) -> ComponentSnapshot {
        let mut snapshot = ComponentSnapshot::new(self.id(), self.name(), self.kind())
            .with_mood(self.mood());
        snapshot.worker = self.worker();
        snapshot.ui_state = self.watch_ui_state().borrow().clone();
        snapshot
    }
}
