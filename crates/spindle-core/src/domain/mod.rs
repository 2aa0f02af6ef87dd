//! Domain model (IDs, states, errors, events, component / profile / activity records).
//!
//! ここには副作用を持たない型だけを置く。

pub mod activity;
pub mod component;
pub mod errors;
pub mod events;
pub mod ids;
pub mod mood;
pub mod notification;
pub mod profile;
pub mod state;
pub mod worker;

pub use activity::{ActivityRecord, ActivityState, NotificationActivity, TranscodingActivity};
pub use component::{
    ComponentKind, ComponentProperties, ComponentSnapshot, Fingerprint, UiState,
};
pub use errors::{AdminError, ErrorKind};
pub use events::{IncomingFile, JobOutcome, SchedulerEvent, ServiceEvent, TaskEvent};
pub use ids::{ActivityId, ComponentId, TaskId};
pub use mood::Mood;
pub use notification::{
    Document, NotificationKind, NotificationLevel, NotificationSpec, NotifyRequest, NotifyTrigger,
};
pub use profile::{
    ProfileContext, ProfileKey, ProfileTemplate, Target, TargetConfig, TranscodingParams,
};
pub use state::{JobState, ManagerState, TaskState};
pub use worker::{WorkerInfo, WorkerName};
