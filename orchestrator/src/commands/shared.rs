use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use rsq::RedisBackend;
use rsq_config::{RsqSettings, normalize_stream_name};

pub(crate) async fn connect(settings: &RsqSettings) -> Result<Arc<RedisBackend>> {
    let backend = RedisBackend::connect(&settings.redis_dsn).await?;
    tracing::debug!(endpoint = %backend.endpoint(), "connected to Redis");
    Ok(Arc::new(backend))
}

pub(crate) fn resolve_stream(explicit: Option<&str>, configured: &str) -> String {
    match explicit {
        Some(stream) => normalize_stream_name(stream),
        None => configured.to_string(),
    }
}

/// Reading the pending list of a group that was never created fails with
/// `NOGROUP`; for reporting that is the same as an empty list.
pub(crate) fn is_missing_group(err: &anyhow::Error) -> bool {
    format!("{err:#}").contains("NOGROUP")
}

/// Parses a CLI value as JSON, falling back to a plain string.
pub(crate) fn parse_json_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub(crate) fn top_counts(map: &HashMap<String, usize>, limit: usize) -> Vec<(String, usize)> {
    let mut items = map.iter().map(|(k, v)| (k.clone(), *v)).collect::<Vec<_>>();
    items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    items.into_iter().take(limit).collect()
}
