//! Job processor registry.
//!
//! The queue stores only a processor name with each job; this registry maps
//! that name back to runnable code. A processor is a set of per-queue
//! handlers plus an optional fallback, so a job popped from queue `reports`
//! runs the `reports` handler when one is registered and the fallback
//! otherwise.
//!
//! Processors registered through a factory can be rebuilt on demand:
//! `mark_for_reload_on_next_lookup` flags the cached instance stale and the
//! next lookup re-runs the factory.

use crate::error::ProcessingError;
use crate::job::Job;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A single job handler.
pub type ProcessorHandler =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<(), ProcessingError>> + Send + Sync>;

/// A named set of handlers for one processor class.
#[derive(Clone, Default)]
pub struct Processor {
    handlers: HashMap<String, ProcessorHandler>,
    fallback: Option<ProcessorHandler>,
}

impl Processor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::default()
    }

    /// The handler for a queue: the queue-specific one when registered,
    /// else the fallback.
    pub fn handler_for(&self, queue: &str) -> Option<ProcessorHandler> {
        self.handlers
            .get(queue)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Builder for [`Processor`].
#[derive(Default)]
pub struct ProcessorBuilder {
    handlers: HashMap<String, ProcessorHandler>,
    fallback: Option<ProcessorHandler>,
}

impl ProcessorBuilder {
    /// Register a handler for jobs popped from a specific queue.
    pub fn on_queue<F, Fut>(mut self, queue: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ProcessingError>> + Send + 'static,
    {
        self.handlers
            .insert(queue.into(), Arc::new(move |job| Box::pin(handler(job))));
        self
    }

    /// Register the fallback handler, run for any queue without its own.
    pub fn process<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ProcessingError>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |job| Box::pin(handler(job))));
        self
    }

    pub fn build(self) -> Processor {
        Processor {
            handlers: self.handlers,
            fallback: self.fallback,
        }
    }
}

struct RegistryEntry {
    processor: Option<Arc<Processor>>,
    factory: Option<Arc<dyn Fn() -> Processor + Send + Sync>>,
    stale: bool,
}

/// Maps processor names to processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready-built processor under a name.
    pub fn register(&self, name: impl Into<String>, processor: Processor) {
        let name = name.into();
        debug!(processor = %name, "Registered processor");
        self.entries.write().insert(
            name,
            RegistryEntry {
                processor: Some(Arc::new(processor)),
                factory: None,
                stale: false,
            },
        );
    }

    /// Register a factory; the processor is built on first lookup and
    /// rebuilt after `mark_for_reload_on_next_lookup`.
    pub fn register_factory<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Processor + Send + Sync + 'static,
    {
        self.entries.write().insert(
            name.into(),
            RegistryEntry {
                processor: None,
                factory: Some(Arc::new(factory)),
                stale: true,
            },
        );
    }

    /// Look up a processor by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Processor>> {
        {
            let entries = self.entries.read();
            let entry = entries.get(name)?;
            if !entry.stale {
                if let Some(processor) = &entry.processor {
                    return Some(processor.clone());
                }
            }
        }

        let mut entries = self.entries.write();
        let entry = entries.get_mut(name)?;
        if entry.stale || entry.processor.is_none() {
            if let Some(factory) = &entry.factory {
                entry.processor = Some(Arc::new(factory()));
                entry.stale = false;
            }
        }
        entry.processor.clone()
    }

    /// Flag a processor so its factory runs again on the next lookup. A
    /// no-op for processors registered without a factory.
    pub fn mark_for_reload_on_next_lookup(&self, name: &str) {
        if let Some(entry) = self.entries.write().get_mut(name) {
            if entry.factory.is_some() {
                entry.stale = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lookup_unknown_is_none() {
        let registry = ProcessorRegistry::new();
        assert!(registry.lookup("missing.Klass").is_none());
    }

    #[test]
    fn test_queue_handler_beats_fallback() {
        let processor = Processor::builder()
            .on_queue("reports", |_job| async { Ok(()) })
            .process(|_job| async { Err(ProcessingError::new("Nope", "fallback ran")) })
            .build();

        assert!(processor.handler_for("reports").is_some());
        assert!(processor.handler_for("anything-else").is_some());
    }

    #[test]
    fn test_no_fallback_declines_other_queues() {
        let processor = Processor::builder()
            .on_queue("bar", |_job| async { Ok(()) })
            .build();

        assert!(processor.handler_for("bar").is_some());
        assert!(processor.handler_for("foo").is_none());
    }

    #[test]
    fn test_factory_rebuilds_after_reload_mark() {
        let registry = ProcessorRegistry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        registry.register_factory("app.Reports", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Processor::builder().process(|_job| async { Ok(()) }).build()
        });

        registry.lookup("app.Reports").unwrap();
        registry.lookup("app.Reports").unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        registry.mark_for_reload_on_next_lookup("app.Reports");
        registry.lookup("app.Reports").unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reload_mark_without_factory_is_noop() {
        let registry = ProcessorRegistry::new();
        registry.register(
            "app.Static",
            Processor::builder().process(|_job| async { Ok(()) }).build(),
        );
        registry.mark_for_reload_on_next_lookup("app.Static");
        assert!(registry.lookup("app.Static").is_some());
    }
}
