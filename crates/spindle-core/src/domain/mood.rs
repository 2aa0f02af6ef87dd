//! Component mood as reported by the remote component host.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of a remote component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Happy,
    Sad,
    /// The manager lost contact with the component. Usually transient.
    Lost,
    Sleeping,
    Waking,
}

impl Mood {
    /// Moods from which a component may still become happy on its own.
    pub fn is_transitional(self) -> bool {
        matches!(self, Mood::Waking | Mood::Lost)
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mood::Happy => "happy",
            Mood::Sad => "sad",
            Mood::Lost => "lost",
            Mood::Sleeping => "sleeping",
            Mood::Waking => "waking",
        };
        f.write_str(s)
    }
}
