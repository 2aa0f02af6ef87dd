//! Ports - 抽象化レイヤー
//!
//! 状態機械の外側にある協調者（リモート component、loader、activity 永続化、
//! 通知、時刻、ID）へのインターフェース。実装は `impls` に置く。
//!
//! # 設計原則
//! - 状態機械は ports を直接呼ばない（Effect を出すだけ）
//! - ports を呼ぶのは runtime だけ
//! - Clock / IdGenerator は同期で、状態機械からも使う

pub mod activity_store;
pub mod clock;
pub mod component;
pub mod id_generator;
pub mod loader;
pub mod notifier;

pub use self::activity_store::ActivityStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::component::ComponentProxy;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::loader::{ComponentLoader, LoadRequest};
pub use self::notifier::Notifier;
