pub mod config;
pub mod defaults;
pub mod settings;

pub use config::{
    DEFAULT_CONFIG_FILENAME, ENV_CONFIG_KEY, load_toml_settings, resolve_config_source,
    validate_settings,
};
pub use defaults::*;
pub use settings::{CronJobConfig, RsqSettings};

/// Prefixes bare stream names with `rsq:stream:`; already-prefixed names pass through.
#[must_use]
pub fn normalize_stream_name(stream_name: &str) -> String {
    if stream_name.starts_with(STREAM_KEY_PREFIX) {
        stream_name.to_string()
    } else {
        format!("{STREAM_KEY_PREFIX}{stream_name}")
    }
}
