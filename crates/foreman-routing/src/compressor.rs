use foreman_core::{ForemanError, ForemanResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

/// Longest a non-preserved string value may be after truncation, in bytes.
const TRUNCATED_VALUE_MAX: usize = 512;

/// How a context payload was reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Payload passed through unchanged.
    None,
    /// Oversized non-preserved string values were shortened.
    Truncate,
    /// Only preserve-listed keys were kept.
    PreservedOnly,
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionStrategy::None => write!(f, "none"),
            CompressionStrategy::Truncate => write!(f, "truncate"),
            CompressionStrategy::PreservedOnly => write!(f, "preserved_only"),
        }
    }
}

/// Result of size-reducing a context payload.
#[derive(Debug, Clone, Serialize)]
pub struct CompressedContext {
    /// The reduced payload.
    pub content: Value,
    /// Serialized size before reduction.
    pub original_size: usize,
    /// Serialized size after reduction.
    pub compressed_size: usize,
    /// `compressed_size / original_size`.
    pub ratio: f64,
    /// The strategy that was achieved.
    pub strategy: CompressionStrategy,
    /// Preserve-listed keys actually present in the payload.
    pub preserved_keys: Vec<String>,
}

/// Reduces context payloads to a byte budget while passing preserve-listed
/// keys through untouched.
///
/// Strategies are tried in order: `None` (already within budget),
/// `Truncate`, `PreservedOnly`. Compression never fails the caller: any
/// internal error degrades to `None` with the original payload.
#[derive(Debug, Default)]
pub struct ContextCompressor;

impl ContextCompressor {
    /// Compress `context` down to `max_bytes`.
    pub fn compress(
        &self,
        context: &Value,
        max_bytes: usize,
        preserve_keys: &[String],
    ) -> CompressedContext {
        match self.try_compress(context, max_bytes, preserve_keys) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!(error = %e, "compression failed, passing context through uncompressed");
                let size = serialized_size(context).unwrap_or(0);
                CompressedContext {
                    content: context.clone(),
                    original_size: size,
                    compressed_size: size,
                    ratio: 1.0,
                    strategy: CompressionStrategy::None,
                    preserved_keys: present_keys(context, preserve_keys),
                }
            }
        }
    }

    fn try_compress(
        &self,
        context: &Value,
        max_bytes: usize,
        preserve_keys: &[String],
    ) -> ForemanResult<CompressedContext> {
        let original_size = serialized_size(context)?;
        let preserved = present_keys(context, preserve_keys);

        if original_size <= max_bytes {
            return Ok(CompressedContext {
                content: context.clone(),
                original_size,
                compressed_size: original_size,
                ratio: 1.0,
                strategy: CompressionStrategy::None,
                preserved_keys: preserved,
            });
        }

        let Value::Object(map) = context else {
            // Nothing key-wise to drop; hand it over as-is.
            debug!(original_size, max_bytes, "non-object context over budget, not compressed");
            return Ok(CompressedContext {
                content: context.clone(),
                original_size,
                compressed_size: original_size,
                ratio: 1.0,
                strategy: CompressionStrategy::None,
                preserved_keys: preserved,
            });
        };

        // Strategy: truncate oversized non-preserved string values.
        let mut truncated = Map::new();
        for (key, value) in map {
            if preserve_keys.contains(key) {
                truncated.insert(key.clone(), value.clone());
                continue;
            }
            match value {
                Value::String(s) if s.len() > TRUNCATED_VALUE_MAX => {
                    truncated.insert(key.clone(), Value::String(truncate_str(s)));
                }
                _ => {
                    truncated.insert(key.clone(), value.clone());
                }
            }
        }
        let truncated = Value::Object(truncated);
        let truncated_size = serialized_size(&truncated)?;
        if truncated_size <= max_bytes {
            return Ok(CompressedContext {
                content: truncated,
                original_size,
                compressed_size: truncated_size,
                ratio: truncated_size as f64 / original_size as f64,
                strategy: CompressionStrategy::Truncate,
                preserved_keys: preserved,
            });
        }

        // Last resort: keep only the preserve-listed keys, untouched.
        let mut kept = Map::new();
        for key in preserve_keys {
            if let Some(value) = map.get(key) {
                kept.insert(key.clone(), value.clone());
            }
        }
        let kept = Value::Object(kept);
        let kept_size = serialized_size(&kept)?;
        if kept_size > max_bytes {
            // Preserved keys are sacrosanct, so the budget is unattainable.
            warn!(
                kept_size,
                max_bytes, "preserved keys alone exceed the context budget"
            );
        }
        Ok(CompressedContext {
            content: kept,
            original_size,
            compressed_size: kept_size,
            ratio: kept_size as f64 / original_size as f64,
            strategy: CompressionStrategy::PreservedOnly,
            preserved_keys: preserved,
        })
    }
}

fn serialized_size(value: &Value) -> ForemanResult<usize> {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .map_err(|e| ForemanError::Compression(e.to_string()))
}

fn present_keys(context: &Value, preserve_keys: &[String]) -> Vec<String> {
    match context {
        Value::Object(map) => preserve_keys
            .iter()
            .filter(|k| map.contains_key(*k))
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

fn truncate_str(s: &str) -> String {
    let mut end = TRUNCATED_VALUE_MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
