use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;

use crate::cli_utils::{format_duration, truncate};
use rsq::backend::{PendingEntry, StreamBackend, StreamId};
use rsq::load_toml_settings;

use super::shared::{connect, is_missing_group, resolve_stream, top_counts};

const SCAN_BATCH: usize = 200;

#[derive(Debug, Default, PartialEq)]
pub(crate) struct QueueStats {
    pub(crate) length: u64,
    pub(crate) pending: usize,
    pub(crate) oldest_idle: Option<Duration>,
    pub(crate) max_deliveries: u64,
    pub(crate) consumers: HashMap<String, usize>,
}

pub(crate) async fn collect_queue_stats(
    backend: &dyn StreamBackend,
    stream: &str,
    group: &str,
) -> Result<QueueStats> {
    let mut stats = QueueStats {
        length: backend.len(stream).await?,
        ..QueueStats::default()
    };
    let mut after: Option<StreamId> = None;
    loop {
        let page = match backend.pending(stream, group, after, SCAN_BATCH).await {
            Ok(page) => page,
            Err(err) if is_missing_group(&err) => break,
            Err(err) => return Err(err),
        };
        for entry in &page {
            stats.pending += 1;
            stats.max_deliveries = stats.max_deliveries.max(entry.deliveries);
            stats.oldest_idle = Some(
                stats
                    .oldest_idle
                    .map_or(entry.idle, |idle| idle.max(entry.idle)),
            );
            *stats.consumers.entry(entry.consumer.clone()).or_insert(0) += 1;
        }
        if page.len() < SCAN_BATCH {
            break;
        }
        after = page.last().map(|entry| entry.id);
    }
    Ok(stats)
}

pub(crate) async fn collect_pending(
    backend: &dyn StreamBackend,
    stream: &str,
    group: &str,
    limit: usize,
) -> Result<Vec<PendingEntry>> {
    match backend.pending(stream, group, None, limit).await {
        Ok(entries) => Ok(entries),
        Err(err) if is_missing_group(&err) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

pub(crate) async fn queue_stats(config: Option<String>, stream: Option<String>) -> Result<()> {
    let settings = load_toml_settings(config.as_deref())?;
    let stream = resolve_stream(stream.as_deref(), &settings.stream_name);
    let backend = connect(&settings).await?;
    let stats = collect_queue_stats(backend.as_ref(), &stream, &settings.consumer_group).await?;

    println!("Stream:          {stream}");
    println!("Group:           {}", settings.consumer_group);
    println!("Entries:         {}", stats.length);
    println!("Pending:         {}", stats.pending);
    if let Some(idle) = stats.oldest_idle {
        println!("Longest idle:    {}", format_duration(idle.as_secs_f64()));
        println!("Max deliveries:  {}", stats.max_deliveries);
    }
    if !stats.consumers.is_empty() {
        println!("\n{:<40} {:>10}", "Consumer", "Pending");
        for (consumer, count) in top_counts(&stats.consumers, 20) {
            println!("{:<40} {:>10}", truncate(&consumer, 40), count);
        }
    }
    Ok(())
}

pub(crate) async fn queue_pending(
    config: Option<String>,
    stream: Option<String>,
    limit: usize,
) -> Result<()> {
    let settings = load_toml_settings(config.as_deref())?;
    let stream = resolve_stream(stream.as_deref(), &settings.stream_name);
    let backend = connect(&settings).await?;
    let entries =
        collect_pending(backend.as_ref(), &stream, &settings.consumer_group, limit).await?;
    if entries.is_empty() {
        println!("No pending messages on {stream}");
        return Ok(());
    }
    println!(
        "{:<24} {:<40} {:>12} {:>11}",
        "ID", "Consumer", "Idle", "Deliveries"
    );
    for entry in entries {
        println!(
            "{:<24} {:<40} {:>12} {:>11}",
            entry.id.to_string(),
            truncate(&entry.consumer, 40),
            format_duration(entry.idle.as_secs_f64()),
            entry.deliveries
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsq::MemoryBackend;

    #[tokio::test]
    async fn stats_on_missing_group_report_no_pending() {
        let backend = MemoryBackend::new();
        backend.append("orders", b"{}").await.unwrap();
        let stats = collect_queue_stats(&backend, "orders", "workers").await.unwrap();
        assert_eq!(stats.length, 1);
        assert_eq!(stats.pending, 0);
        assert!(stats.oldest_idle.is_none());
    }

    #[tokio::test]
    async fn stats_count_pending_per_consumer() {
        let backend = MemoryBackend::new();
        backend.create_group("orders", "workers").await.unwrap();
        for _ in 0..3 {
            backend.append("orders", b"{}").await.unwrap();
        }
        for consumer in ["a", "a", "b"] {
            backend
                .read_group("orders", "workers", consumer, None)
                .await
                .unwrap()
                .unwrap();
        }
        let stats = collect_queue_stats(&backend, "orders", "workers").await.unwrap();
        assert_eq!(stats.length, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.max_deliveries, 1);
        assert_eq!(stats.consumers.get("a"), Some(&2));
        assert_eq!(stats.consumers.get("b"), Some(&1));
    }

    #[tokio::test]
    async fn pending_listing_respects_limit() {
        let backend = MemoryBackend::new();
        backend.create_group("orders", "workers").await.unwrap();
        for _ in 0..4 {
            backend.append("orders", b"{}").await.unwrap();
            backend
                .read_group("orders", "workers", "a", None)
                .await
                .unwrap()
                .unwrap();
        }
        let entries = collect_pending(&backend, "orders", "workers", 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].id < entries[1].id);
        assert!(collect_pending(&backend, "missing", "workers", 2).await.unwrap().is_empty());
    }
}
