//! Dynamic-mapping transformer.
//!
//! Expands `@identifier` references through the server-stored mapping, then
//! resolves wildcard and negated patterns against the currently known queue
//! names. The mapping is cached and refreshed on a timer.

use super::QueueIdentifiersTransformer;
use crate::client::Client;
use crate::error::QuillResult;
use crate::patterns::PatternSource;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Default cache lifetime for the fetched mapping.
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

/// Resolve patterns to real queue names.
///
/// Pure; this is the primary test surface. Rules, applied left to right:
///   - `@name` expands to the mapping's patterns for `name`; a leading `!`
///     on the reference flips each expanded pattern's polarity.
///   - A static pattern (no `*`, no `!`) is always appended, even when no
///     such queue currently exists.
///   - A positive wildcard appends every known queue matching it.
///   - A negated pattern removes matching queues from the result so far.
/// The output preserves first-insertion order and holds no duplicates.
pub fn resolve_queue_names(
    dynamic_queue_mapping: &HashMap<String, Vec<String>>,
    known_queue_names: &[String],
    patterns: &[String],
) -> Vec<String> {
    // First, expand dynamic identifiers, negating where appropriate.
    let mut expanded: Vec<String> = Vec::new();
    for queue_pattern in patterns {
        let negated = queue_pattern.starts_with('!');
        let bare = if negated {
            &queue_pattern[1..]
        } else {
            queue_pattern.as_str()
        };
        if let Some(identifier) = bare.strip_prefix('@') {
            for pattern in dynamic_queue_mapping
                .get(identifier)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                if negated {
                    match pattern.strip_prefix('!') {
                        Some(positive) => expanded.push(positive.to_string()),
                        None => expanded.push(format!("!{}", pattern)),
                    }
                } else {
                    expanded.push(pattern.clone());
                }
            }
        } else {
            expanded.push(queue_pattern.clone());
        }
    }

    // Next, resolve patterns to actual queue names.
    let mut matched: Vec<String> = Vec::new();
    for pattern in &expanded {
        let is_static = !pattern.contains('!') && !pattern.contains('*');
        if is_static {
            if !matched.contains(pattern) {
                matched.push(pattern.clone());
            }
            continue;
        }

        let negated = pattern.starts_with('!');
        let bare = if negated { &pattern[1..] } else { pattern.as_str() };
        let Some(regex) = pattern_regex(bare) else {
            continue;
        };
        for known in known_queue_names {
            if regex.is_match(known) {
                if negated {
                    matched.retain(|name| name != known);
                } else if !matched.contains(known) {
                    // A match keeps its earliest position unless removed
                    // outright.
                    matched.push(known.clone());
                }
            }
        }
    }

    matched
}

/// Transformer backed by the server-stored mapping and the live queue list.
pub struct DynamicMappingTransformer {
    client: Client,
    source: PatternSource,
    refresh_frequency: Duration,
    cache: Mutex<Option<(Instant, HashMap<String, Vec<String>>)>>,
}

impl DynamicMappingTransformer {
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

    async fn dynamic_queue_mapping(&self) -> QuillResult<HashMap<String, Vec<String>>> {
        let mut cache = self.cache.lock().await;
        if let Some((fetched_at, mapping)) = cache.as_ref() {
            if fetched_at.elapsed() < self.refresh_frequency {
                return Ok(mapping.clone());
            }
        }
        let mapping = self
            .client
            .queue_patterns_with(self.source)
            .queue_identifier_patterns()
            .await?;
        *cache = Some((Instant::now(), mapping.clone()));
        Ok(mapping)
    }
}

#[async_trait]
impl QueueIdentifiersTransformer for DynamicMappingTransformer {
    async fn transform(&self, identifiers: Vec<String>) -> QuillResult<Vec<String>> {
        let mapping = self.dynamic_queue_mapping().await?;
        let known = self.client.queues().names().await?;
        Ok(resolve_queue_names(&mapping, &known, &identifiers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_client, RecordingInvoker};
    use redis::Value;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn mapping(entries: &[(&str, Vec<&str>)]) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(identifier, patterns)| (identifier.to_string(), strings(patterns)))
            .collect()
    }

    #[test]
    fn test_exact_match() {
        let known = strings(&["exact_queue_name", "exact_queue_name_extended"]);
        let got = resolve_queue_names(
            &HashMap::new(),
            &known,
            &strings(&["exact_queue_name"]),
        );
        assert_eq!(got, ["exact_queue_name"]);
    }

    #[test]
    fn test_negated_exact_match() {
        let known = strings(&["exact_queue_name", "exact_queue_name_extended"]);
        let got = resolve_queue_names(
            &HashMap::new(),
            &known,
            &strings(&["*", "!exact_queue_name_extended"]),
        );
        assert_eq!(got, ["exact_queue_name"]);
    }

    #[test]
    fn test_wildcard_match() {
        let known = strings(&[
            "exact_queue_name",
            "exact_queue_name_extended",
            "other_queue_name",
        ]);
        let got = resolve_queue_names(&HashMap::new(), &known, &strings(&["exact*"]));
        assert_eq!(got, ["exact_queue_name", "exact_queue_name_extended"]);

        let got = resolve_queue_names(&HashMap::new(), &known, &strings(&["*"]));
        assert_eq!(got, known);
    }

    #[test]
    fn test_negated_wildcard_match() {
        let known = strings(&[
            "exact_queue_name",
            "exact_queue_name_extended",
            "other_queue_name",
        ]);
        let got = resolve_queue_names(&HashMap::new(), &known, &strings(&["*", "!exact*"]));
        assert_eq!(got, ["other_queue_name"]);

        let got = resolve_queue_names(&HashMap::new(), &known, &strings(&["*", "!*"]));
        assert!(got.is_empty());
    }

    #[test]
    fn test_dynamic_reference_expansion() {
        let known = strings(&[
            "exact_queue_name",
            "exact_queue_name_extended",
            "other_queue_name",
        ]);
        let got = resolve_queue_names(
            &mapping(&[("exact", vec!["exact_queue_name"])]),
            &known,
            &strings(&["@exact", "other_queue_name"]),
        );
        assert_eq!(got, ["exact_queue_name", "other_queue_name"]);
    }

    #[test]
    fn test_dynamic_reference_with_negated_member() {
        // Scenario: mapping holds a negation, the reference is positive.
        let known = strings(&[
            "exact_queue_name",
            "exact_queue_name_extended",
            "other_queue_name",
        ]);
        let got = resolve_queue_names(
            &mapping(&[("exact", vec!["!exact_queue_name_extended"])]),
            &known,
            &strings(&["exact*", "@exact"]),
        );
        assert_eq!(got, ["exact_queue_name"]);
    }

    #[test]
    fn test_negated_dynamic_reference_flips_polarity() {
        let known = strings(&[
            "exact_queue_name",
            "exact_queue_name_extended",
            "other_queue_name",
        ]);
        let got = resolve_queue_names(
            &mapping(&[("exact", vec!["exact*"])]),
            &known,
            &strings(&["*", "!@exact"]),
        );
        assert_eq!(got, ["other_queue_name"]);

        // Double negation includes.
        let got = resolve_queue_names(
            &mapping(&[("exact", vec!["!exact*"])]),
            &known,
            &strings(&["!@exact"]),
        );
        assert_eq!(got, ["exact_queue_name", "exact_queue_name_extended"]);
    }

    #[test]
    fn test_a_little_bit_of_everything() {
        let known = strings(&[
            "exact_queue_name",
            "exact_queue_name_extended",
            "no_match_queue_name",
            "other_queue_name",
        ]);
        let got = resolve_queue_names(
            &mapping(&[
                ("exact", vec!["exact*"]),
                ("inexact", vec!["!exact*"]),
                ("other", vec!["other*"]),
            ]),
            &known,
            &strings(&[
                "*",
                "!@exact",
                "!@inexact",
                "!exact_queue_name_extended",
                "@other",
                "!no*",
            ]),
        );
        assert_eq!(got, ["other_queue_name", "exact_queue_name"]);
    }

    #[test]
    fn test_no_duplicates() {
        let known = strings(&["exact_queue_name", "exact_queue_name_extended"]);
        let got = resolve_queue_names(
            &mapping(&[
                ("exact", vec!["exact_queue_name"]),
                ("inexact", vec!["!exact_queue_name"]),
            ]),
            &known,
            &strings(&[
                "exact_queue_name",
                "@exact",
                "!@exact",
                "exact*",
                "!other*",
                "!exact_queue_name_extended",
            ]),
        );
        assert_eq!(got, ["exact_queue_name"]);
    }

    #[test]
    fn test_static_names_survive_without_existing_queue() {
        let got = resolve_queue_names(
            &HashMap::new(),
            &[],
            &strings(&["queue-that-does-not-exist-yet"]),
        );
        assert_eq!(got, ["queue-that-does-not-exist-yet"]);
    }

    #[test]
    fn test_idempotent_on_resolved_static_list() {
        let known = strings(&["a", "b", "c"]);
        let once = resolve_queue_names(&HashMap::new(), &known, &strings(&["b", "a"]));
        let twice = resolve_queue_names(&HashMap::new(), &known, &once);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_transform_caches_mapping() {
        let invoker = RecordingInvoker::new();
        // First transform: one mapping fetch plus one queues fetch.
        invoker.push_reply(Ok(Value::BulkString(b"{}".to_vec())));
        invoker.push_reply(Ok(Value::BulkString(
            br#"[{"name": "alpha"}, {"name": "beta"}]"#.to_vec(),
        )));
        // Second transform: only the queues fetch; the mapping is cached.
        invoker.push_reply(Ok(Value::BulkString(
            br#"[{"name": "alpha"}, {"name": "beta"}]"#.to_vec(),
        )));

        let transformer = DynamicMappingTransformer::new(test_client(invoker.clone()));
        let got = transformer
            .transform(vec!["@default".to_string()])
            .await
            .unwrap();
        assert_eq!(got, ["alpha", "beta"]);

        let got = transformer
            .transform(vec!["@default".to_string()])
            .await
            .unwrap();
        assert_eq!(got, ["alpha", "beta"]);

        let commands: Vec<String> = invoker
            .calls()
            .into_iter()
            .map(|(command, _)| command)
            .collect();
        assert_eq!(
            commands,
            ["queueIdentifierPatterns.getAll", "queues", "queues"]
        );
    }

    #[tokio::test]
    async fn test_transform_refreshes_after_expiry() {
        tokio::time::pause();
        let invoker = RecordingInvoker::new();
        for _ in 0..2 {
            invoker.push_reply(Ok(Value::BulkString(b"{}".to_vec())));
            invoker.push_reply(Ok(Value::BulkString(br#"[{"name": "alpha"}]"#.to_vec())));
        }

        let transformer = DynamicMappingTransformer::with_refresh_frequency(
            test_client(invoker.clone()),
            Duration::from_millis(500),
        );
        transformer.transform(vec!["*".to_string()]).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        transformer.transform(vec!["*".to_string()]).await.unwrap();

        let fetches = invoker
            .calls()
            .iter()
            .filter(|(command, _)| command == "queueIdentifierPatterns.getAll")
            .count();
        assert_eq!(fetches, 2);
    }
}
