//! The Scheduler Service (spec.md §4.11): fires due [`crate::model::Schedule`]s
//! into the [`crate::dispatcher::Dispatcher`], coordinated across instances by
//! the [`crate::lock_manager::LockManager`].

pub mod backend;
pub mod service;

pub use backend::{IntervalTicker, TickFn, TickerBackend, TickerError, TickerHealth};
pub use service::{SchedulerError, SchedulerHealth, SchedulerService};
