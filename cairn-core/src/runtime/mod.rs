//! Long-lived tasks and the supervisor that owns them.
//!
//! A [`SyncEngine`] bundles the engine components built from one
//! [`SyncConfig`](crate::config::SyncConfig). [`SyncRuntime`] spawns the
//! watcher, the scheduler, the claim housekeeper and the worker pool around
//! an engine and tears them down in order.

mod engine;
mod scheduler;
mod supervisor;
mod worker;

pub use engine::SyncEngine;
pub use scheduler::next_daily_run;
pub use supervisor::SyncRuntime;
