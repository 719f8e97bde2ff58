use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::defaults::MAX_SCHEDULE_HORIZON_SECONDS;
use crate::settings::RsqSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "rsq.toml";
pub const ENV_CONFIG_KEY: &str = "RSQ_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "--config parameter".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY)
        && !env_path.is_empty()
    {
        return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "not found".to_string())
}

/// Loads settings from TOML, overlays `RSQ_*` environment variables and
/// validates the result. Without any config file the defaults plus
/// environment overrides are used.
pub fn load_toml_settings(config_path: Option<&str>) -> Result<RsqSettings> {
    dotenvy::dotenv().ok();

    let (path, source) = resolve_config_source(config_path);
    let file_value = match path {
        Some(path) => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {path} ({source})"))?;
            let toml_value: toml::Value = toml::from_str(&payload)
                .with_context(|| format!("failed to parse TOML at {path}"))?;
            let json_value =
                serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;
            normalize_toml_payload(json_value)?
        }
        None => Value::Object(Map::new()),
    };

    let env_overrides = env_overrides()?;
    let merged = deep_merge(file_value, env_overrides);

    let settings: RsqSettings =
        serde_json::from_value(merged).map_err(|err| anyhow::anyhow!("invalid rsq config: {err}"))?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn normalize_toml_payload(mut payload: Value) -> Result<Value> {
    if let Value::Object(mut map) = payload {
        if let Some(rsq_value) = map.remove("rsq") {
            payload = rsq_value;
        } else {
            payload = Value::Object(map);
        }
    }

    if let Value::Object(mut map) = payload {
        // `[[rsq.cron]]` is accepted as shorthand for `cron_jobs`.
        if let Some(cron) = map.remove("cron") {
            map.insert("cron_jobs".to_string(), cron);
        }
        return Ok(Value::Object(map));
    }

    Err(anyhow::anyhow!("rsq config must be a TOML table"))
}

fn env_overrides() -> Result<Value> {
    let mut payload = Map::new();

    set_env_string(&mut payload, "redis_dsn", "RSQ_REDIS_DSN");
    set_env_string(&mut payload, "stream_name", "RSQ_STREAM_NAME");
    set_env_string(&mut payload, "consumer_group", "RSQ_CONSUMER_GROUP");
    set_env_string(&mut payload, "dead_letter_stream", "RSQ_DEAD_LETTER_STREAM");
    set_env_float(
        &mut payload,
        "stuck_timeout_seconds",
        "RSQ_STUCK_TIMEOUT_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "stuck_check_interval_seconds",
        "RSQ_STUCK_CHECK_INTERVAL_SECONDS",
    )?;
    set_env_int(&mut payload, "pending_scan_batch", "RSQ_PENDING_SCAN_BATCH")?;
    set_env_string(&mut payload, "lock_name", "RSQ_LOCK_NAME");
    set_env_float(&mut payload, "lock_ttl_seconds", "RSQ_LOCK_TTL_SECONDS")?;
    set_env_float(
        &mut payload,
        "lock_retry_wait_seconds",
        "RSQ_LOCK_RETRY_WAIT_SECONDS",
    )?;
    set_env_float(
        &mut payload,
        "lock_acquire_timeout_seconds",
        "RSQ_LOCK_ACQUIRE_TIMEOUT_SECONDS",
    )?;
    set_env_string(&mut payload, "last_run_key_prefix", "RSQ_LAST_RUN_KEY_PREFIX");
    set_env_float(&mut payload, "max_wait_seconds", "RSQ_MAX_WAIT_SECONDS")?;
    set_env_int(
        &mut payload,
        "schedule_horizon_seconds",
        "RSQ_SCHEDULE_HORIZON_SECONDS",
    )?;
    set_env_int(&mut payload, "worker_concurrency", "RSQ_WORKER_CONCURRENCY")?;
    set_env_float(
        &mut payload,
        "error_backoff_seconds",
        "RSQ_ERROR_BACKOFF_SECONDS",
    )?;

    Ok(Value::Object(payload))
}

fn set_env_string(map: &mut Map<String, Value>, key: &str, env: &str) {
    if let Ok(value) = std::env::var(env)
        && !value.is_empty()
    {
        map.insert(key.to_string(), Value::String(value));
    }
}

fn set_env_int(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: i64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(key.to_string(), Value::Number(parsed.into()));
    }
    Ok(())
}

fn set_env_float(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: f64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(
            key.to_string(),
            Value::Number(
                serde_json::Number::from_f64(parsed)
                    .ok_or_else(|| anyhow::anyhow!("Invalid {env} value: {value}"))?,
            ),
        );
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let entry = base_map.remove(&key);
                let merged = match entry {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}

pub fn validate_settings(settings: &RsqSettings) -> Result<()> {
    let positive = [
        ("stuck_timeout_seconds", settings.stuck_timeout_seconds),
        (
            "stuck_check_interval_seconds",
            settings.stuck_check_interval_seconds,
        ),
        ("lock_ttl_seconds", settings.lock_ttl_seconds),
        ("lock_retry_wait_seconds", settings.lock_retry_wait_seconds),
        ("max_wait_seconds", settings.max_wait_seconds),
    ];
    for (name, value) in positive {
        if !value.is_finite() || value <= 0.0 {
            return Err(anyhow::anyhow!(
                "{name} must be a positive number of seconds, got {value}"
            ));
        }
    }
    if !settings.lock_acquire_timeout_seconds.is_finite()
        || settings.lock_acquire_timeout_seconds < 0.0
    {
        return Err(anyhow::anyhow!(
            "lock_acquire_timeout_seconds must be >= 0, got {}",
            settings.lock_acquire_timeout_seconds
        ));
    }
    if !settings.error_backoff_seconds.is_finite() || settings.error_backoff_seconds < 0.0 {
        return Err(anyhow::anyhow!(
            "error_backoff_seconds must be >= 0, got {}",
            settings.error_backoff_seconds
        ));
    }
    if settings.lock_ttl_seconds <= settings.lock_retry_wait_seconds {
        return Err(anyhow::anyhow!(
            "lock_ttl_seconds ({}) must exceed lock_retry_wait_seconds ({})",
            settings.lock_ttl_seconds,
            settings.lock_retry_wait_seconds
        ));
    }
    if settings.pending_scan_batch == 0 {
        return Err(anyhow::anyhow!(
            "pending_scan_batch must be a positive integer"
        ));
    }
    if settings.worker_concurrency == 0 {
        return Err(anyhow::anyhow!(
            "worker_concurrency must be a positive integer"
        ));
    }
    if settings.schedule_horizon_seconds <= 0
        || settings.schedule_horizon_seconds > MAX_SCHEDULE_HORIZON_SECONDS
    {
        return Err(anyhow::anyhow!(
            "schedule_horizon_seconds must be between 1 and {MAX_SCHEDULE_HORIZON_SECONDS}, got {}",
            settings.schedule_horizon_seconds
        ));
    }
    if settings.stream_name.is_empty() || settings.consumer_group.is_empty() {
        return Err(anyhow::anyhow!(
            "stream_name and consumer_group must not be empty"
        ));
    }
    if let Some(dead_letter) = settings.dead_letter_stream.as_deref()
        && dead_letter == settings.stream_name
    {
        return Err(anyhow::anyhow!(
            "dead_letter_stream must differ from stream_name ('{dead_letter}')"
        ));
    }
    for (index, job) in settings.cron_jobs.iter().enumerate() {
        if job.function_name.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "cron_jobs[{index}] is missing function_name"
            ));
        }
        if job.schedule.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "cron job '{}' has an empty schedule",
                job.function_name
            ));
        }
    }
    Ok(())
}
