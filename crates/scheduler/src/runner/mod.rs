//! Scheduler runner: the dispatch loop and its supervised worker pool.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, lifecycle (start/stop/join), and the submission API
//! - `dispatch`: the dispatch loop, worker supervision, drain, and forced termination

mod core;
mod dispatch;

pub use self::core::Scheduler;
