//! Notification model.
//!
//! Delivery is the notifier's job; this module only describes what to send,
//! when, and at which level of the configuration it was declared.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::profile::ProfileKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTrigger {
    Done,
    Failed,
}

impl fmt::Display for NotifyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyTrigger::Done => f.write_str("done"),
            NotifyTrigger::Failed => f.write_str("failed"),
        }
    }
}

/// Where a notification was declared. Fan-out runs in this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "level", content = "name", rename_all = "snake_case")]
pub enum NotificationLevel {
    Global,
    Customer,
    Profile,
    Target(String),
    /// Sent when a task could not run at all (retries exhausted).
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    Email {
        recipients: Vec<String>,
        #[serde(default)]
        subject: Option<String>,
    },
    Http {
        url: String,
    },
    Sql {
        connection: String,
        statement: String,
    },
}

/// A configured notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSpec {
    pub level: NotificationLevel,
    pub triggers: Vec<NotifyTrigger>,
    pub kind: NotificationKind,
}

impl NotificationSpec {
    pub fn fires_on(&self, trigger: NotifyTrigger) -> bool {
        self.triggers.contains(&trigger)
    }
}

/// A document attached to a notification (job report, diagnostics, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub label: String,
    pub mime_type: String,
    pub body: String,
}

/// Everything a notifier needs to deliver one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub label: String,
    pub trigger: NotifyTrigger,
    pub level: NotificationLevel,
    pub profile: ProfileKey,
    pub kind: NotificationKind,
    pub variables: BTreeMap<String, String>,
    pub documents: Vec<Document>,
}
