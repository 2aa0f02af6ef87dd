//! spindle-core
//!
//! Admin control plane of a transcoding cluster: supervises remote monitor and
//! transcoder components, balances them over workers and schedules jobs.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, component, mood, state, errors, events, profile, activity, notification）
//! - **waiters**: 非同期の待ち合わせ（値・カウンタ・割り当て・受動）
//! - **balancer**: タスクを worker に配る water-filling
//! - **admin**: Admin Task 状態機械、TaskManager、monitor / transcoding の種別
//! - **scheduler**: 優先度キューと受け入れ制御
//! - **service**: monitor と scheduler をまとめた最上位の状態機械
//! - **runtime**: 状態機械を動かす tokio ループ（Effect の実行、component レジストリ）
//! - **ports**: 外部との境界（ComponentProxy, ComponentLoader, ActivityStore, Notifier, Clock, IdGenerator）
//! - **impls**: 開発用の実装（シミュレーション、インメモリ）
//! - **config**: JSON 設定

pub mod admin;
pub mod balancer;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod waiters;
