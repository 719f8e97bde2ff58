use anyhow::Result;
use serde_json::Value;

use crate::cli_utils::{format_timestamp, truncate};
use rsq::backend::{StreamBackend, StreamId};
use rsq::{DeadLetterEntry, load_toml_settings};

use super::shared::{connect, resolve_stream};

const PAGE_SIZE: usize = 100;

pub(crate) struct DlqListOptions {
    pub(crate) config: Option<String>,
    pub(crate) stream: Option<String>,
    pub(crate) function: Option<String>,
    pub(crate) limit: usize,
    pub(crate) raw: bool,
}

fn entry_function(entry: &DeadLetterEntry) -> Option<&str> {
    entry.event.get("func").and_then(Value::as_str)
}

/// Oldest first. Entries that do not decode as dead letters are skipped.
pub(crate) async fn collect_dead_letters(
    backend: &dyn StreamBackend,
    stream: &str,
    function: Option<&str>,
    limit: usize,
) -> Result<Vec<(StreamId, DeadLetterEntry)>> {
    let mut results = Vec::new();
    let mut after = None;
    while results.len() < limit {
        let page = backend.range(stream, after, PAGE_SIZE).await?;
        for item in &page {
            let entry: DeadLetterEntry = match serde_json::from_slice(&item.payload) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(id = %item.id, "skipping undecodable dead letter: {err}");
                    continue;
                }
            };
            if function.is_some_and(|func| entry_function(&entry) != Some(func)) {
                continue;
            }
            results.push((item.id, entry));
            if results.len() >= limit {
                break;
            }
        }
        if page.len() < PAGE_SIZE {
            break;
        }
        after = page.last().map(|item| item.id);
    }
    Ok(results)
}

pub(crate) async fn dlq_list(options: DlqListOptions) -> Result<()> {
    let settings = load_toml_settings(options.config.as_deref())?;
    let stream = match (&options.stream, &settings.dead_letter_stream) {
        (Some(stream), _) => resolve_stream(Some(stream.as_str()), &settings.stream_name),
        (None, Some(configured)) => configured.clone(),
        (None, None) => anyhow::bail!(
            "no dead-letter stream configured; pass --stream or set dead_letter_stream"
        ),
    };
    let backend = connect(&settings).await?;
    let entries = collect_dead_letters(
        backend.as_ref(),
        &stream,
        options.function.as_deref(),
        options.limit,
    )
    .await?;

    if options.raw {
        let rows = entries
            .iter()
            .map(|(id, entry)| serde_json::json!({"id": id, "entry": entry}))
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No dead letters on {stream}");
        return Ok(());
    }
    println!(
        "{:<24} {:<28} {:<20} {:<50}",
        "ID", "Function", "Failed", "Error"
    );
    for (id, entry) in &entries {
        println!(
            "{:<24} {:<28} {:<20} {:<50}",
            id.to_string(),
            truncate(entry_function(entry).unwrap_or("-"), 28),
            format_timestamp(entry.failed_at),
            truncate(&entry.error, 50)
        );
    }
    println!("\n{} dead letter(s) shown", entries.len());
    Ok(())
}
