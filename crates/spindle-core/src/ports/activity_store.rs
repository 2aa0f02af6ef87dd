//! ActivityStore port - activity の永続化
//!
//! スキーマは問わない。状態遷移の境界で store / delete / reset を呼ぶだけ。

use crate::domain::activity::ActivityRecord;
use crate::domain::errors::AdminError;
use crate::domain::ids::ActivityId;

#[async_trait::async_trait]
pub trait ActivityStore: Send + Sync {
    async fn store(&self, record: ActivityRecord) -> Result<(), AdminError>;

    async fn delete(&self, id: ActivityId) -> Result<(), AdminError>;

    /// Drop unsaved changes after a failed `store`.
    async fn reset(&self, id: ActivityId) -> Result<(), AdminError>;
}
