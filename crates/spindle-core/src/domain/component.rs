//! Component views: kind, launch properties (and their fingerprint), UI state.
//!
//! Tasks never own remote components. They keep a `ComponentSnapshot`, a plain
//! copy of what the admin last observed, and address the component by id.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::ids::ComponentId;
use super::mood::Mood;
use super::worker::WorkerName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Monitor,
    Transcoder,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Monitor => f.write_str("monitor"),
            ComponentKind::Transcoder => f.write_str("transcoder"),
        }
    }
}

/// Content hash of a component's launch properties.
///
/// Used to correlate remote component instances to logical tasks across
/// manager and admin restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 短縮表示（ログ用）
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// Launch properties of a component.
///
/// `serde_json::Map` is ordered by key, so the serialized form is canonical and
/// the fingerprint does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentProperties(serde_json::Map<String, serde_json::Value>);

impl ComponentProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let canonical = serde_json::Value::Object(self.0.clone()).to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for ComponentProperties {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// UI state blob published by a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UiState(serde_json::Value);

impl UiState {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Look up a string by JSON pointer, e.g. `/job-data/status`.
    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(|v| v.as_str())
    }
}

/// What the admin currently knows about a remote component.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSnapshot {
    pub id: ComponentId,
    pub name: String,
    pub kind: ComponentKind,
    pub worker: Option<WorkerName>,
    pub mood: Mood,
    pub ui_state: Option<UiState>,
}

impl ComponentSnapshot {
    pub fn new(id: ComponentId, name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            worker: None,
            mood: Mood::Sleeping,
            ui_state: None,
        }
    }

    pub fn on_worker(mut self, worker: WorkerName) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn with_mood(mut self, mood: Mood) -> Self {
        self.mood = mood;
        self
    }

    pub fn with_ui_state(mut self, ui_state: UiState) -> Self {
        self.ui_state = Some(ui_state);
        self
    }

    pub fn runs_on(&self, worker: Option<&WorkerName>) -> bool {
        match worker {
            Some(w) => self.worker.as_ref() == Some(w),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let a = ComponentProperties::new()
            .with("input", "/in/a.mp4")
            .with("profile", "hd");
        let b = ComponentProperties::new()
            .with("profile", "hd")
            .with("input", "/in/a.mp4");

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = ComponentProperties::new().with("profile", "hd");
        let b = ComponentProperties::new().with("profile", "sd");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn ui_state_pointer_lookup() {
        let ui = UiState::new(json!({"job-data": {"status": "done"}}));
        assert_eq!(ui.str_at("/job-data/status"), Some("done"));
        assert_eq!(ui.str_at("/job-data/missing"), None);
    }

    #[test]
    fn runs_on_any_worker_when_none_requested() {
        let c = ComponentSnapshot::new(ComponentId::generate(), "t1", ComponentKind::Transcoder)
            .on_worker(WorkerName::new("w1"));
        assert!(c.runs_on(None));
        assert!(c.runs_on(Some(&WorkerName::new("w1"))));
        assert!(!c.runs_on(Some(&WorkerName::new("w2"))));
    }
}
