//! Job store and next-job selection.
//!
//! Split into focused submodules:
//! - `core`: JobQueue struct, submission, and read-only views
//! - `selection`: priority / deadline / submission-time ordering
//! - `transitions`: the status state machine, cancellation, and purge

mod core;
mod selection;
mod transitions;

pub use self::core::{status_counts, JobFilter, JobQueue};
