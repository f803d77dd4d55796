//! Dynamic-priority transformer.
//!
//! Reorders an already-resolved queue list into priority bands. Each stored
//! pattern claims unconsumed queues into a bucket; the literal `default`
//! band marks where everything unclaimed goes. Buckets flagged fair are
//! shuffled with an OS-entropy-seeded RNG.

use super::QueueIdentifiersTransformer;
use crate::client::Client;
use crate::error::QuillResult;
use crate::patterns::{PatternSource, QueuePriorityPattern};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Default cache lifetime for the fetched priority patterns.
pub const DEFAULT_REFRESH_FREQUENCY: Duration = Duration::from_secs(300);

fn pattern_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("^{}$", pattern.replace('*', ".*"))) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!(pattern = %pattern, error = %err, "Skipping unparseable pattern");
            None
        }
    }
}

/// Reorder queues into priority bands.
///
/// Pure apart from the fair shuffles; this is the primary test surface. The
/// output is always a permutation of the input.
pub fn prioritize_queues(
    queue_identifiers: &[String],
    queue_priority_patterns: &[QueuePriorityPattern],
) -> Vec<String> {
    let mut rng = StdRng::from_entropy();
    let mut unconsumed: Vec<String> = queue_identifiers.to_vec();
    let mut groups: Vec<Vec<String>> = Vec::new();

    let mut default_index: Option<usize> = None;
    let mut default_fairly = false;

    for priority_pattern in queue_priority_patterns {
        if priority_pattern.patterns == ["default"] {
            default_index = Some(groups.len());
            default_fairly = priority_pattern.should_distribute_fairly;
            continue;
        }

        let mut bucket: Vec<String> = Vec::new();
        for pattern in &priority_pattern.patterns {
            let negated = pattern.starts_with('!');
            let bare = if negated { &pattern[1..] } else { pattern.as_str() };
            let Some(regex) = pattern_regex(bare) else {
                continue;
            };

            if negated {
                bucket.retain(|queue| !regex.is_match(queue));
            } else {
                for queue in &unconsumed {
                    if regex.is_match(queue) && !bucket.contains(queue) {
                        bucket.push(queue.clone());
                    }
                }
            }
        }

        unconsumed.retain(|queue| !bucket.contains(queue));

        if priority_pattern.should_distribute_fairly {
            bucket.shuffle(&mut rng);
        }
        groups.push(bucket);
    }

    if default_fairly {
        unconsumed.shuffle(&mut rng);
    }
    let default_index = default_index.unwrap_or(groups.len());
    groups.insert(default_index, unconsumed);

    groups.into_iter().flatten().collect()
}

/// Transformer backed by the server-stored priority patterns.
pub struct DynamicPriorityTransformer {
    client: Client,
    source: PatternSource,
    refresh_frequency: Duration,
    cache: Mutex<Option<(Instant, Vec<QueuePriorityPattern>)>>,
}

impl DynamicPriorityTransformer {
    pub fn new(client: Client) -> Self {
        Self::with_refresh_frequency(client, DEFAULT_REFRESH_FREQUENCY)
    }

    pub fn with_refresh_frequency(client: Client, refresh_frequency: Duration) -> Self {
        Self {
            client,
            source: PatternSource::default(),
            refresh_frequency,
            cache: Mutex::new(None),
        }
    }

    pub fn pattern_source(mut self, source: PatternSource) -> Self {
        self.source = source;
        self
    }

    async fn dynamic_queue_priorities(&self) -> QuillResult<Vec<QueuePriorityPattern>> {
        let mut cache = self.cache.lock().await;
        if let Some((fetched_at, patterns)) = cache.as_ref() {
            if fetched_at.elapsed() < self.refresh_frequency {
                return Ok(patterns.clone());
            }
        }
        let patterns = self
            .client
            .queue_patterns_with(self.source)
            .queue_priority_patterns()
            .await?;
        *cache = Some((Instant::now(), patterns.clone()));
        Ok(patterns)
    }
}

#[async_trait]
impl QueueIdentifiersTransformer for DynamicPriorityTransformer {
    async fn transform(&self, identifiers: Vec<String>) -> QuillResult<Vec<String>> {
        let patterns = self.dynamic_queue_priorities().await?;
        Ok(prioritize_queues(&identifiers, &patterns))
    }
}
