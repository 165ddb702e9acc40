//! Handler registry: the process-wide `(kind, name)` → handler mapping
//! consulted by executors (spec.md §4.4).
//!
//! Grounded on the teacher's `engine::registry::WorkflowRegistry` type-erasure
//! pattern, generalized from a single `workflow_type` key to the spec's
//! `(kind, name)` pair. Reads take a read lock, registration takes a write
//! lock, matching §5's "read-mostly... guarded by a mutex" guidance.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::errors::SpineError;
use crate::model::WorkKind;

/// The future type returned by a boxed handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, SpineError>> + Send>>;

/// A handler: `params -> result`, possibly asynchronous. Both synchronous
/// and asynchronous handler bodies compose via `async move { ... }` blocks
/// at the registration call site (§9: "the dispatcher's interface is
/// uniformly blocking from the caller's perspective").
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub kind: WorkKind,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

struct Entry {
    handler: Handler,
    description: Option<String>,
    tags: Vec<String>,
}

/// Error raised when a `(kind, name)` is not registered.
#[derive(Debug, thiserror::Error)]
#[error("no handler registered for {kind} \"{name}\"")]
pub struct HandlerNotFound {
    pub kind: WorkKind,
    pub name: String,
}

/// Error raised when registering a duplicate `(kind, name)`.
#[derive(Debug, thiserror::Error)]
#[error("handler already registered for {kind} \"{name}\"")]
pub struct DuplicateHandler {
    pub kind: WorkKind,
    pub name: String,
}

/// The process-wide handler registry.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<(WorkKind, String), Entry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `(kind, name)`. Fails on duplicate
    /// registration (spec.md §4.4).
    pub fn register<F, Fut>(
        &self,
        kind: WorkKind,
        name: impl Into<String>,
        handler: F,
        description: Option<String>,
        tags: Vec<String>,
    ) -> Result<(), DuplicateHandler>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SpineError>> + Send + 'static,
    {
        let name = name.into();
        let key = (kind, name.clone());
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(DuplicateHandler { kind, name });
        }
        let boxed: Handler = Arc::new(move |params| Box::pin(handler(params)));
        entries.insert(
            key,
            Entry {
                handler: boxed,
                description,
                tags,
            },
        );
        Ok(())
    }

    /// Register many handlers at once. Used at process startup in place of
    /// the original source's reflection-based `discover()` (§9: a compiled
    /// language has no runtime package scan, so registration is explicit).
    pub fn register_many<I>(&self, handlers: I) -> Result<(), DuplicateHandler>
    where
        I: IntoIterator<Item = (WorkKind, String, Handler, Option<String>, Vec<String>)>,
    {
        for (kind, name, handler, description, tags) in handlers {
            let key = (kind, name.clone());
            let mut entries = self.entries.write();
            if entries.contains_key(&key) {
                return Err(DuplicateHandler { kind, name });
            }
            entries.insert(
                key,
                Entry {
                    handler,
                    description,
                    tags,
                },
            );
        }
        Ok(())
    }

    pub fn get(&self, kind: WorkKind, name: &str) -> Result<Handler, HandlerNotFound> {
        self.entries
            .read()
            .get(&(kind, name.to_string()))
            .map(|e| e.handler.clone())
            .ok_or_else(|| HandlerNotFound {
                kind,
                name: name.to_string(),
            })
    }

    pub fn has(&self, kind: WorkKind, name: &str) -> bool {
        self.entries.read().contains_key(&(kind, name.to_string()))
    }

    pub fn list_with_metadata(&self) -> Vec<HandlerMetadata> {
        self.entries
            .read()
            .iter()
            .map(|((kind, name), entry)| HandlerMetadata {
                kind: *kind,
                name: name.clone(),
                description: entry.description.clone(),
                tags: entry.tags.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_invoke_roundtrips_params() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                WorkKind::Task,
                "echo",
                |params: Value| async move { Ok(params) },
                None,
                vec![],
            )
            .unwrap();

        let handler = registry.get(WorkKind::Task, "echo").unwrap();
        let result = handler(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(result["x"], 1);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = HandlerRegistry::new();
        registry
            .register(WorkKind::Task, "dup", |p: Value| async move { Ok(p) }, None, vec![])
            .unwrap();
        let err = registry
            .register(WorkKind::Task, "dup", |p: Value| async move { Ok(p) }, None, vec![])
            .unwrap_err();
        assert_eq!(err.name, "dup");
    }

    #[test]
    fn missing_handler_reports_not_found() {
        let registry = HandlerRegistry::new();
        assert!(!registry.has(WorkKind::Task, "missing"));
        assert!(registry.get(WorkKind::Task, "missing").is_err());
    }
}
