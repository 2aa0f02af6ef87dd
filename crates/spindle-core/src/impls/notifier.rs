//! LogNotifier - 通知をログに書くだけの notifier
//!
//! 緊急通知の宛先は構築時に渡す `NotifierConfig` から埋める。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::errors::AdminError;
use crate::domain::notification::{NotificationKind, NotificationLevel, NotifyRequest};
use crate::ports::Notifier;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Recipients of emergency mails that declare none.
    pub emergency_recipients: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LogNotifier {
    config: NotifierConfig,
    sent: Mutex<Vec<NotifyRequest>>,
}

impl LogNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            config,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Requests delivered so far, as sent.
    pub fn sent(&self) -> Vec<NotifyRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, mut request: NotifyRequest) -> Result<(), AdminError> {
        if request.level == NotificationLevel::Emergency
            && let NotificationKind::Email { recipients, .. } = &mut request.kind
            && recipients.is_empty()
        {
            if self.config.emergency_recipients.is_empty() {
                return Err(AdminError::Rejected(
                    "no emergency recipients configured".into(),
                ));
            }
            recipients.clone_from(&self.config.emergency_recipients);
        }

        let target = match &request.kind {
            NotificationKind::Email { recipients, .. } => recipients.join(","),
            NotificationKind::Http { url } => url.clone(),
            NotificationKind::Sql { connection, .. } => connection.clone(),
        };
        info!(
            label = %request.label,
            trigger = %request.trigger,
            level = ?request.level,
            %target,
            documents = request.documents.len(),
            "notification sent"
        );
        self.sent.lock().push(request);
        Ok(())
    }
}
