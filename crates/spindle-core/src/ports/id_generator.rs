//! IdGenerator port - ID と component 名の生成
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）
//!
//! pending load の名前もここで作る。名前はタスク内で一意であればよいが、
//! ULID を混ぜておけばクラスタ全体で衝突しない。

use crate::domain::component::ComponentKind;
use crate::domain::ids::{ActivityId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（状態機械と runtime の両方から使う）
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn activity_id(&self) -> ActivityId;

    /// Fresh unique name for a component about to be loaded.
    fn component_name(&self, kind: ComponentKind, label: &str) -> String;
}

/// UlidGenerator は Clock の時刻で ULID を作る
///
/// FixedClock を渡すと timestamp 部分が固定される。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn activity_id(&self) -> ActivityId {
        ActivityId::from(self.next())
    }

    fn component_name(&self, kind: ComponentKind, label: &str) -> String {
        let slug: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        format!("{kind}-{slug}-{}", self.next().to_string().to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn component_names_are_unique_and_readable() {
        let id_gen = UlidGenerator::new(SystemClock);

        let a = id_gen.component_name(ComponentKind::Transcoder, "acme/hd/Movie 1.mov");
        let b = id_gen.component_name(ComponentKind::Transcoder, "acme/hd/Movie 1.mov");

        assert_ne!(a, b);
        assert!(a.starts_with("transcoder-acme-hd-movie-1-mov-"));
        assert!(!a.contains(' '));
    }

    #[test]
    fn fixed_clock_pins_the_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn id_prefixes_differ_by_type() {
        let id_gen = UlidGenerator::new(SystemClock);

        assert!(id_gen.task_id().to_string().starts_with("task-"));
        assert!(id_gen.activity_id().to_string().starts_with("activity-"));
    }
}
