use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a worker host, unique within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerName(String);

impl WorkerName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A worker as announced by the worker set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: WorkerName,

    /// Maximum number of concurrent transcoding tasks.
    pub max_tasks: usize,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, max_tasks: usize) -> Self {
        Self {
            name: WorkerName::new(name),
            max_tasks,
        }
    }
}
