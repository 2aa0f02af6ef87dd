//! Notifier port - 通知の配送
//!
//! 配送の仕組み（メール、HTTP、SQL）は実装側の責務。
//! 呼び出し側は失敗をログに残して握りつぶす。

use crate::domain::errors::AdminError;
use crate::domain::notification::NotifyRequest;

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: NotifyRequest) -> Result<(), AdminError>;
}
