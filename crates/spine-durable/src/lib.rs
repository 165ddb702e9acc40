//! Spine's durable execution engine (spec.md §2): the dispatcher, handler
//! registry, pluggable executors, worker loop, workflow engine, scheduler,
//! lock manager, resilience primitives, event bus, and the ledger that
//! backs all of it.
//!
//! The HTTP/REST API, MCP tool adapter, and CLI are external collaborators
//! layered on top of this crate; they consume it only through
//! [`dispatcher::Dispatcher`] and [`ops`] (spec.md §1). Nothing in this
//! crate depends on them.

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod lock_manager;
pub mod logging;
pub mod model;
pub mod ops;
pub mod registry;
pub mod repositories;
pub mod resilience;
pub mod scheduler;
pub mod worker;
pub mod workflow_engine;

pub use config::Config;
pub use dispatcher::{DispatchError, Dispatcher, SubmitOutcome};
pub use errors::{ErrorCategory, SpineError};
pub use events::{EventBus, EventEnvelope, InMemoryEventBus, SubscriptionId};
pub use ledger::{Ledger, LedgerError};
pub use lock_manager::LockManager;
pub use registry::HandlerRegistry;
