//! Nestable deadlines (spec.md §4.7), carried on a task-local stack — the
//! Rust analogue of the original source's contextvars-based deadline stack,
//! per §9's "use the language's task/goroutine context carrier" guidance.

use std::cell::RefCell;
use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("operation {operation:?} exceeded its deadline (elapsed {elapsed:?})")]
    TimeoutExpired {
        operation: String,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone)]
struct Deadline {
    operation: String,
    at: Instant,
}

tokio::task_local! {
    static DEADLINE_STACK: RefCell<Vec<Deadline>>;
}

/// Push a new deadline of `secs` seconds (clamped to the shorter of any
/// enclosing deadline's remaining time) for the duration of `fut`, popping it
/// on completion regardless of success or failure.
pub async fn with_deadline<F, T>(secs: u64, operation_name: impl Into<String>, fut: F) -> T
where
    F: Future<Output = T>,
{
    let operation = operation_name.into();
    let requested = Instant::now() + Duration::from_secs(secs);

    let run = async {
        let effective = DEADLINE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let clamped = stack
                .last()
                .map(|parent| requested.min(parent.at))
                .unwrap_or(requested);
            stack.push(Deadline {
                operation: operation.clone(),
                at: clamped,
            });
            clamped
        });
        let _ = effective;
        let result = fut.await;
        DEADLINE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        result
    };

    if DEADLINE_STACK.try_with(|_| ()).is_ok() {
        run.await
    } else {
        DEADLINE_STACK.scope(RefCell::new(Vec::new()), run).await
    }
}

/// Check the innermost deadline, if any is active. Returns
/// [`DeadlineError::TimeoutExpired`] once the nearest enclosing deadline has
/// passed; cooperative callers should check this at loop boundaries and
/// between steps.
pub fn check_deadline() -> Result<(), DeadlineError> {
    let Ok(expired) = DEADLINE_STACK.try_with(|stack| {
        let stack = stack.borrow();
        stack.last().and_then(|d| {
            let now = Instant::now();
            if now >= d.at {
                Some((d.operation.clone(), now.duration_since(d.at)))
            } else {
                None
            }
        })
    }) else {
        return Ok(());
    };

    match expired {
        Some((operation, elapsed)) => Err(DeadlineError::TimeoutExpired { operation, elapsed }),
        None => Ok(()),
    }
}

/// One-shot wrapper: runs `f(args)` under a deadline of `secs` seconds,
/// pushed onto the task-local stack so any [`check_deadline`] call inside
/// `f` observes it too. Returns [`DeadlineError::TimeoutExpired`] if `f`
/// hasn't finished when the deadline elapses (spec.md §4.7).
pub async fn run_with_timeout<F, Fut, A, T>(f: F, secs: u64, args: A) -> Result<T, DeadlineError>
where
    F: FnOnce(A) -> Fut,
    Fut: Future<Output = T>,
{
    let operation = std::any::type_name::<F>().to_string();
    with_deadline(secs, operation.clone(), async move {
        match tokio::time::timeout(Duration::from_secs(secs), f(args)).await {
            Ok(value) => Ok(value),
            Err(_) => Err(DeadlineError::TimeoutExpired {
                operation,
                elapsed: Duration::from_secs(secs),
            }),
        }
    })
    .await
}

/// Time left on the innermost deadline, if any is active. `None` means there
/// is no enclosing deadline; `Some(Duration::ZERO)` means it has already
/// expired. Used by [`super::retry::with_retry`] to decide whether the
/// remaining budget can still cover the next backoff delay.
pub fn remaining_deadline() -> Option<Duration> {
    DEADLINE_STACK
        .try_with(|stack| stack.borrow().last().map(|d| d.at.saturating_duration_since(Instant::now())))
        .unwrap_or(None)
}
