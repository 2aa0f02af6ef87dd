//! Profiles: what to transcode, for whom, and with which priority.
//!
//! A `ProfileTemplate` comes from configuration (customer + profile settings).
//! A `ProfileContext` is the template bound to one incoming file; it is the
//! unit the scheduler queues and admits.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::notification::NotificationSpec;

/// Identifies one (customer, profile, file) request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileKey {
    pub customer: String,
    pub profile: String,
    pub file: String,
}

impl ProfileKey {
    pub fn new(
        customer: impl Into<String>,
        profile: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        Self {
            customer: customer.into(),
            profile: profile.into(),
            file: file.into(),
        }
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.customer, self.profile, self.file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub codec: String,
    pub bitrate_kbps: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
}

fn default_channels() -> u8 {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSettings {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThumbnailSettings {
    pub interval_secs: u32,
    pub width: u32,
}

/// Output configuration of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConfig {
    Audio {
        audio: AudioSettings,
    },
    Video {
        video: VideoSettings,
    },
    AudioVideo {
        audio: AudioSettings,
        video: VideoSettings,
    },
    Thumbnails {
        thumbnails: ThumbnailSettings,
    },
    /// Copy the input unchanged.
    Identity,
}

impl TargetConfig {
    pub fn audio(&self) -> Option<&AudioSettings> {
        match self {
            TargetConfig::Audio { audio } | TargetConfig::AudioVideo { audio, .. } => Some(audio),
            _ => None,
        }
    }

    pub fn video(&self) -> Option<&VideoSettings> {
        match self {
            TargetConfig::Video { video } | TargetConfig::AudioVideo { video, .. } => Some(video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub output: String,
    pub config: TargetConfig,
}

/// Per customer/profile settings loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileTemplate {
    pub customer: String,
    pub profile: String,
    #[serde(default)]
    pub customer_priority: u32,
    #[serde(default)]
    pub profile_priority: u32,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub notifications: Vec<NotificationSpec>,
}

impl ProfileTemplate {
    pub fn bind(&self, file: impl Into<String>) -> ProfileContext {
        let key = ProfileKey::new(&self.customer, &self.profile, file);
        ProfileContext {
            label: format!("{} ({})", key, self.profile),
            key,
            customer_priority: self.customer_priority,
            profile_priority: self.profile_priority,
            targets: self.targets.clone(),
            notifications: self.notifications.clone(),
        }
    }
}

/// A profile bound to one incoming file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileContext {
    pub key: ProfileKey,
    pub label: String,
    pub customer_priority: u32,
    pub profile_priority: u32,
    pub targets: Vec<Target>,
    pub notifications: Vec<NotificationSpec>,
}

impl ProfileContext {
    /// Scheduling priority. Higher runs first.
    pub fn priority(&self) -> u64 {
        u64::from(self.customer_priority) * 1000 + u64::from(self.profile_priority)
    }
}

/// Per-request parameters passed along with a profile to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscodingParams {
    pub input_path: String,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TranscodingParams {
    pub fn new(input_path: impl Into<String>) -> Self {
        Self {
            input_path: input_path.into(),
            extra: serde_json::Map::new(),
        }
    }
}
