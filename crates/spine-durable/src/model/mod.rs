//! The data model (spec.md §3): `WorkSpec`, `RunRecord`, `Event`, `Schedule`,
//! locks, DLQ entries, manifest stages, rejects, and the workflow/step/context
//! types the orchestration layer threads through a run.

pub mod dlq;
pub mod event;
pub mod lock;
pub mod manifest;
pub mod reject;
pub mod run_record;
pub mod schedule;
pub mod work_spec;
pub mod workflow;

pub use dlq::DeadLetter;
pub use event::{Event, EventType};
pub use lock::{ConcurrencyLock, ScheduleLock};
pub use manifest::{canonical_partition_key, ManifestStage};
pub use reject::Reject;
pub use run_record::{is_allowed_transition, source_states_for, RunRecord, RunStatus};
pub use schedule::{Schedule, ScheduleTargetType, ScheduleTiming};
pub use work_spec::{TriggerSource, WorkKind, WorkSpec};
pub use workflow::{ExecutionPolicy, OnError, Step, StepType, Workflow, WorkflowContext};
