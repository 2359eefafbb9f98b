//! The task engine: durable store, scheduler, and the commit protocol.
//!
//! Data flow for one download:
//!
//! ```text
//! REST -> TaskStore.insert(queued) -> TaskScheduler.pump -> worker
//!      -> adapter.run(staging, progress, stop)
//!      -> commit::publish(staging -> comics/<safe_id>)
//!      -> terminal task state (succeeded | failed | canceled | paused)
//! ```

pub mod commit;
mod item;
mod scheduler;
mod store;

pub use commit::{CommitError, CommitOutcome};
pub use item::{Task, TaskParams, TaskStatus};
pub use scheduler::{ALREADY_DOWNLOADED, SchedulerError, TaskScheduler};
pub use store::{StoreError, TaskStore};
