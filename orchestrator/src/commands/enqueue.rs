use anyhow::Result;
use serde_json::Value;

use rsq::Client;
use rsq_config::load_toml_settings;

use super::shared::{connect, parse_json_value, resolve_stream};

pub(crate) struct EnqueueOptions {
    pub(crate) config: Option<String>,
    pub(crate) function_name: String,
    pub(crate) args: Vec<String>,
    pub(crate) kwargs: Vec<String>,
    pub(crate) stream: Option<String>,
}

pub(crate) async fn enqueue(options: EnqueueOptions) -> Result<()> {
    let mut settings = load_toml_settings(options.config.as_deref())?;
    settings.stream_name = resolve_stream(options.stream.as_deref(), &settings.stream_name);
    let (args, kwargs) = build_arguments(&options.args, &options.kwargs)?;

    let backend = connect(&settings).await?;
    let client = Client::from_settings(backend, &settings);
    let id = client.enqueue(&options.function_name, args, kwargs).await?;
    println!(
        "Enqueued {} as {id} on {}",
        options.function_name, settings.stream_name
    );
    Ok(())
}

fn build_arguments(
    args: &[String],
    kwargs: &[String],
) -> Result<(Vec<Value>, serde_json::Map<String, Value>)> {
    let args = args.iter().map(|raw| parse_json_value(raw)).collect();
    let mut parsed = serde_json::Map::new();
    for raw in kwargs {
        let Some((key, value)) = raw.split_once('=') else {
            anyhow::bail!("invalid --kwarg {raw:?}; expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid --kwarg {raw:?}; key must not be empty");
        }
        parsed.insert(key.to_string(), parse_json_value(value));
    }
    Ok((args, parsed))
}
