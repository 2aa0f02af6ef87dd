//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **SimLoader / SimComponent**: メモリ上のクラスタ
//! - **InMemoryActivityStore**: activity の置き場
//! - **LogNotifier**: ログに書くだけの notifier
//!
//! 本番用の実装（リモート component host、SQL の activity store、メール配送）は
//! 別クレートに置く。

pub mod memory;
pub mod notifier;
pub mod sim;

pub use self::memory::InMemoryActivityStore;
pub use self::notifier::{LogNotifier, NotifierConfig};
pub use self::sim::{SimBehavior, SimComponent, SimConfig, SimLoader};
