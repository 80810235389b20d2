//! 动态分发-汇聚引擎
//!
//! Dispatcher → {Isolator × N} → {WorkerExecutor × N，并发} → Barrier → Aggregator → Router

pub mod aggregator;
pub mod barrier;
pub mod builder;
pub mod dispatcher;
pub mod executor;
pub mod isolator;
pub mod router;
pub mod types;

pub use aggregator::{aggregate, verify_complete};
pub use barrier::Barrier;
pub use builder::DispatcherBuilder;
pub use dispatcher::Dispatcher;
pub use executor::{work_fn, FnWork, UnitOfWork, WorkerExecutor};
pub use isolator::{isolate, isolate_all};
pub use router::{route, NextStage, Stage};
pub use types::*;
