//! backq-core
//!
//! Core building blocks for the back-server side of a task-package pool.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, key 名, tunables, progress record, package state, errors）
//! - **ports**: 抽象化レイヤー（CoordinationStore, PackageSpawner, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（capture, progress, reload, worker_loop, builder）
//! - **impls**: 実装（InMemoryCoordinationStore, EmulatedSpawner など開発用）
//! - **observability**: tracing subscriber の初期化

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
