//! Queue-name resolution.
//!
//! Workers are configured with queue identifiers (literal names, wildcards,
//! negations, `@name` references into the dynamic mapping); a resolver turns
//! those into the ordered list of real queue names to pop from by threading
//! them through zero or more transformers, left to right.

mod mapping;
mod priority;

pub use mapping::{resolve_queue_names, DynamicMappingTransformer};
pub use priority::{prioritize_queues, DynamicPriorityTransformer};

use crate::error::QuillResult;
use async_trait::async_trait;
use std::sync::Arc;

/// One step of the resolution pipeline.
#[async_trait]
pub trait QueueIdentifiersTransformer: Send + Sync {
    async fn transform(&self, identifiers: Vec<String>) -> QuillResult<Vec<String>>;
}

/// Something that yields the ordered queue names a worker consumes from.
#[async_trait]
pub trait QueueResolver: Send + Sync {
    async fn resolve(&self) -> QuillResult<Vec<String>>;
}

/// Composes transformers over a seed identifier list. With no transformers
/// the seed list is returned unchanged.
pub struct TransformingQueueResolver {
    queue_identifiers: Vec<String>,
    transformers: Vec<Arc<dyn QueueIdentifiersTransformer>>,
}

impl TransformingQueueResolver {
    pub fn new(queue_identifiers: Vec<String>) -> Self {
        Self {
            queue_identifiers,
            transformers: Vec::new(),
        }
    }

    pub fn with_transformers(
        queue_identifiers: Vec<String>,
        transformers: Vec<Arc<dyn QueueIdentifiersTransformer>>,
    ) -> Self {
        Self {
            queue_identifiers,
            transformers,
        }
    }
}

#[async_trait]
impl QueueResolver for TransformingQueueResolver {
    async fn resolve(&self) -> QuillResult<Vec<String>> {
        let mut identifiers = self.queue_identifiers.clone();
        for transformer in &self.transformers {
            identifiers = transformer.transform(identifiers).await?;
        }
        Ok(identifiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Suffixer(&'static str);

    #[async_trait]
    impl QueueIdentifiersTransformer for Suffixer {
        async fn transform(&self, identifiers: Vec<String>) -> QuillResult<Vec<String>> {
            Ok(identifiers
                .into_iter()
                .map(|identifier| format!("{}{}", identifier, self.0))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_no_transformers_passes_through() {
        let resolver =
            TransformingQueueResolver::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(resolver.resolve().await.unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_transformers_apply_left_to_right() {
        let resolver = TransformingQueueResolver::with_transformers(
            vec!["q".to_string()],
            vec![Arc::new(Suffixer("-x")), Arc::new(Suffixer("-y"))],
        );
        assert_eq!(resolver.resolve().await.unwrap(), ["q-x-y"]);
    }
}
