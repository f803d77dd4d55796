//! Queue pattern storage.
//!
//! Two encodings exist in the wild. The migrated one stores patterns behind
//! script commands; the legacy one stores them in two raw keys with a
//! comma-joined priority encoding. Both are supported and both canonicalize
//! values to lists on read.

use crate::client::Client;
use crate::error::QuillResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Legacy hash key: identifier -> JSON patterns.
pub const QUEUE_IDENTIFIER_PATTERNS_KEY: &str = "qmore:dynamic";
/// Legacy list key: JSON `{pattern, fairly}` records.
pub const QUEUE_PRIORITY_PATTERNS_KEY: &str = "qmore:priority";

/// One priority band: the patterns selecting its queues and whether the
/// band should be shuffled for fairness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePriorityPattern {
    pub patterns: Vec<String>,
    pub should_distribute_fairly: bool,
}

impl QueuePriorityPattern {
    pub fn new(patterns: Vec<String>, should_distribute_fairly: bool) -> Self {
        Self {
            patterns,
            should_distribute_fairly,
        }
    }
}

/// Which encoding the server holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternSource {
    /// Script commands, JSON-array pattern encoding.
    #[default]
    Script,
    /// Raw `qmore:*` keys, comma-joined priority encoding.
    LegacyKeys,
}

// Mapping values arrive as either a JSON array or a bare string.
fn canonical_mapping_patterns(value: serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        serde_json::Value::String(s) => vec![s],
        _ => Vec::new(),
    }
}

// Priority patterns arrive as either a JSON array or a comma-joined string.
fn canonical_priority_patterns(value: serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        serde_json::Value::String(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
        other => vec![other.to_string()],
    }
}

#[derive(Debug, Deserialize)]
struct PriorityRecord {
    pattern: serde_json::Value,
    #[serde(default)]
    fairly: bool,
}

#[derive(Debug, Serialize)]
struct PriorityRecordOut<'a> {
    fairly: bool,
    pattern: &'a [String],
}

fn parse_priority_record(raw: &str) -> QuillResult<QueuePriorityPattern> {
    let record: PriorityRecord = serde_json::from_str(raw)?;
    Ok(QueuePriorityPattern {
        patterns: canonical_priority_patterns(record.pattern),
        should_distribute_fairly: record.fairly,
    })
}

/// Accessor for the stored patterns.
pub struct QueuePatterns {
    client: Client,
    source: PatternSource,
}

impl QueuePatterns {
    pub fn new(client: Client, source: PatternSource) -> Self {
        Self { client, source }
    }

    pub fn source(&self) -> PatternSource {
        self.source
    }

    /// The identifier -> patterns mapping, canonicalized to lists, with
    /// `{"default": ["*"]}` synthesized when absent.
    pub async fn queue_identifier_patterns(
        &self,
    ) -> QuillResult<HashMap<String, Vec<String>>> {
        let serialized: HashMap<String, String> = match self.source {
            PatternSource::Script => {
                let raw: String = self
                    .client
                    .call("queueIdentifierPatterns.getAll", vec![])
                    .await?;
                match serde_json::from_str::<serde_json::Value>(&raw)? {
                    serde_json::Value::Object(map) => map
                        .into_iter()
                        .map(|(identifier, value)| {
                            let inner = match value {
                                serde_json::Value::String(s) => s,
                                other => other.to_string(),
                            };
                            (identifier, inner)
                        })
                        .collect(),
                    _ => HashMap::new(),
                }
            }
            PatternSource::LegacyKeys => {
                let mut cmd = redis::cmd("HGETALL");
                cmd.arg(QUEUE_IDENTIFIER_PATTERNS_KEY);
                let value = self.client.invoker().command(cmd).await?;
                redis::from_redis_value(&value)?
            }
        };

        let mut patterns: HashMap<String, Vec<String>> = HashMap::new();
        for (identifier, raw) in serialized {
            let value = serde_json::from_str(&raw)
                .unwrap_or(serde_json::Value::String(raw));
            patterns.insert(identifier, canonical_mapping_patterns(value));
        }
        patterns
            .entry("default".to_string())
            .or_insert_with(|| vec!["*".to_string()]);
        Ok(patterns)
    }

    /// Replace the identifier -> patterns mapping.
    pub async fn set_queue_identifier_patterns(
        &self,
        identifier_patterns: HashMap<String, Vec<String>>,
    ) -> QuillResult<()> {
        match self.source {
            PatternSource::Script => {
                let mut args = Vec::with_capacity(identifier_patterns.len() * 2);
                for (identifier, patterns) in identifier_patterns {
                    args.push(identifier);
                    args.push(serde_json::to_string(&patterns)?);
                }
                self.client
                    .call_value("queueIdentifierPatterns.setAll", args)
                    .await?;
            }
            PatternSource::LegacyKeys => {
                let mut pipe = redis::pipe();
                pipe.del(QUEUE_IDENTIFIER_PATTERNS_KEY);
                for (identifier, patterns) in identifier_patterns {
                    pipe.hset(
                        QUEUE_IDENTIFIER_PATTERNS_KEY,
                        identifier,
                        serde_json::to_string(&patterns)?,
                    );
                }
                self.client.invoker().pipeline(pipe).await?;
            }
        }
        Ok(())
    }

    /// The ordered priority bands.
    pub async fn queue_priority_patterns(&self) -> QuillResult<Vec<QueuePriorityPattern>> {
        let records: Vec<String> = match self.source {
            PatternSource::Script => {
                let raw: String = self
                    .client
                    .call("queuePriorityPatterns.getAll", vec![])
                    .await?;
                serde_json::from_str(&raw)?
            }
            PatternSource::LegacyKeys => {
                let mut cmd = redis::cmd("LRANGE");
                cmd.arg(QUEUE_PRIORITY_PATTERNS_KEY).arg(0).arg(-1);
                let value = self.client.invoker().command(cmd).await?;
                redis::from_redis_value(&value)?
            }
        };
        records
            .iter()
            .map(|record| parse_priority_record(record))
            .collect()
    }

    /// Replace the ordered priority bands.
    pub async fn set_queue_priority_patterns(
        &self,
        queue_priority_patterns: Vec<QueuePriorityPattern>,
    ) -> QuillResult<()> {
        match self.source {
            PatternSource::Script => {
                let args = queue_priority_patterns
                    .iter()
                    .map(|pattern| {
                        Ok(serde_json::to_string(&PriorityRecordOut {
                            fairly: pattern.should_distribute_fairly,
                            pattern: &pattern.patterns,
                        })?)
                    })
                    .collect::<QuillResult<Vec<String>>>()?;
                self.client
                    .call_value("queuePriorityPatterns.setAll", args)
                    .await?;
            }
            PatternSource::LegacyKeys => {
                let mut pipe = redis::pipe();
                pipe.del(QUEUE_PRIORITY_PATTERNS_KEY);
                for pattern in &queue_priority_patterns {
                    let record = serde_json::json!({
                        "fairly": pattern.should_distribute_fairly,
                        "pattern": pattern.patterns.join(","),
                    });
                    pipe.rpush(QUEUE_PRIORITY_PATTERNS_KEY, record.to_string());
                }
                self.client.invoker().pipeline(pipe).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_client, RecordingInvoker};
    use redis::Value;

    #[tokio::test]
    async fn test_mapping_canonicalizes_string_values() {
        // `{"default": "*"}` and `{"default": ["*"]}` both appear in stored
        // data; reads canonicalize to lists.
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(
            br#"{"default": "\"*\"", "batch": "[\"batch-*\", \"!batch-low\"]"}"#.to_vec(),
        )));
        let patterns = test_client(invoker).queue_patterns();

        let mapping = patterns.queue_identifier_patterns().await.unwrap();
        assert_eq!(mapping["default"], vec!["*"]);
        assert_eq!(mapping["batch"], vec!["batch-*", "!batch-low"]);
    }

    #[tokio::test]
    async fn test_mapping_synthesizes_default() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(b"{}".to_vec())));
        let patterns = test_client(invoker).queue_patterns();

        let mapping = patterns.queue_identifier_patterns().await.unwrap();
        assert_eq!(mapping["default"], vec!["*"]);
    }

    #[tokio::test]
    async fn test_legacy_mapping_reads_hash() {
        let invoker = RecordingInvoker::new();
        invoker.push_command_reply(Ok(Value::Array(vec![
            Value::BulkString(b"exact".to_vec()),
            Value::BulkString(br#"["exact_queue_name"]"#.to_vec()),
        ])));
        let patterns = test_client(invoker.clone())
            .queue_patterns_with(PatternSource::LegacyKeys);

        let mapping = patterns.queue_identifier_patterns().await.unwrap();
        assert_eq!(mapping["exact"], vec!["exact_queue_name"]);
        assert_eq!(mapping["default"], vec!["*"]);
        assert_eq!(invoker.commands()[0][0], "HGETALL");
    }

    #[tokio::test]
    async fn test_priority_accepts_both_encodings() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::BulkString(
            br#"["{\"pattern\": [\"a*\", \"b*\"], \"fairly\": true}",
                 "{\"pattern\": \"c*, d*\", \"fairly\": false}"]"#
                .to_vec(),
        )));
        let patterns = test_client(invoker).queue_patterns();

        let bands = patterns.queue_priority_patterns().await.unwrap();
        assert_eq!(bands.len(), 2);
        assert_eq!(bands[0].patterns, vec!["a*", "b*"]);
        assert!(bands[0].should_distribute_fairly);
        assert_eq!(bands[1].patterns, vec!["c*", "d*"]);
        assert!(!bands[1].should_distribute_fairly);
    }

    #[tokio::test]
    async fn test_set_priority_patterns_script_envelope() {
        let invoker = RecordingInvoker::new();
        invoker.push_reply(Ok(Value::Okay));
        let patterns = test_client(invoker.clone()).queue_patterns();

        patterns
            .set_queue_priority_patterns(vec![QueuePriorityPattern::new(
                vec!["a*".to_string()],
                true,
            )])
            .await
            .unwrap();

        let calls = invoker.calls();
        assert_eq!(calls[0].0, "queuePriorityPatterns.setAll");
        assert_eq!(calls[0].1, [r#"{"fairly":true,"pattern":["a*"]}"#]);
    }

    #[tokio::test]
    async fn test_set_legacy_uses_pipeline() {
        let invoker = RecordingInvoker::new();
        invoker.push_pipeline_reply(Ok(Value::Okay));
        let patterns = test_client(invoker.clone())
            .queue_patterns_with(PatternSource::LegacyKeys);

        patterns
            .set_queue_priority_patterns(vec![QueuePriorityPattern::new(
                vec!["a*".to_string(), "b*".to_string()],
                false,
            )])
            .await
            .unwrap();
        assert_eq!(invoker.pipeline_count(), 1);
    }
}
