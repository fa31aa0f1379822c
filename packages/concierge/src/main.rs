//! Concierge
//!
//! Reads JSON-lines signals from stdin, journals each one, and dispatches it.
//! Replies are written to stdout as JSON lines. A background task tails the
//! journal and logs every entry it sees.

use std::sync::Arc;

use anyhow::{Context, Result};
use concierge_core::config::DEFAULT_LOG_FILTER;
use concierge_core::{
    dispatcher_pipeline_with_pre_step, reject_empty_retrieve, spawn_dispatcher,
    spawn_search_worker, spawn_things_aggregator, tail_journal, ConciergeConfig, MemoryJournal,
    Reply, Signal, AGGREGATOR_ACTOR_PATH, DISPATCHER_ACTOR_PATH, SEARCH_ACTOR_PATH,
};
use controlflow::{Directory, Envelope};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting Concierge");

    let config = ConciergeConfig::from_env().context("Failed to load configuration")?;
    tracing::debug!(?config, "configuration loaded");

    // Workers, addressed through the directory
    let directory = Directory::new();
    let (search_inbox, search_task) = spawn_search_worker();
    let (aggregator_inbox, aggregator_task) = spawn_things_aggregator();
    directory
        .register(SEARCH_ACTOR_PATH, search_inbox)
        .context("Failed to register search worker")?;
    directory
        .register(AGGREGATOR_ACTOR_PATH, aggregator_inbox)
        .context("Failed to register things aggregator")?;

    // Dispatcher session
    let pipeline = dispatcher_pipeline_with_pre_step(
        &directory,
        directory.destination(AGGREGATOR_ACTOR_PATH),
        reject_empty_retrieve(),
    )
    .context("Failed to build dispatcher pipeline")?;
    let (dispatcher, dispatcher_task) = spawn_dispatcher(&directory, pipeline, config.inbox_capacity)
        .context("Failed to start dispatcher")?;
    drop(dispatcher);

    // Journal and its tail
    let journal = Arc::new(MemoryJournal::new().with_cursor_limit(config.journal_cursor_limit));
    let mut tail = tail_journal(journal.clone(), &config.feed, 0)
        .context("Failed to build journal tail")?;
    let tail_task = tokio::spawn(async move {
        while let Some(item) = tail.next().await {
            match item {
                Ok(entry) => tracing::info!(
                    seq = entry.seq,
                    kind = ?entry.signal.kind(),
                    recorded_at = %entry.recorded_at,
                    "journal entry"
                ),
                Err(e) => {
                    tracing::error!(error = %e, "journal tail failed");
                    break;
                }
            }
        }
    });

    // Replies go to stdout
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            match serde_json::to_string(&reply) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "failed to encode reply"),
            }
        }
    });

    // Signals come from stdin
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let signal: Signal = match serde_json::from_str(line) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed signal");
                continue;
            }
        };
        let seq = journal.append(signal.clone());
        tracing::debug!(seq, kind = ?signal.kind(), "signal journaled");
        directory.send(DISPATCHER_ACTOR_PATH, Envelope::new(signal, reply_tx.clone()));
    }

    tracing::info!("stdin closed, shutting down");

    // Closing the dispatcher inbox lets the session drain and stop
    directory.unregister(DISPATCHER_ACTOR_PATH);
    let stats = dispatcher_task.await.context("Dispatcher task panicked")?;
    tracing::info!(
        forwarded = stats.forwarded,
        dead_lettered = stats.dead_lettered,
        dropped = stats.dropped,
        "dispatcher stopped"
    );

    directory.unregister(SEARCH_ACTOR_PATH);
    directory.unregister(AGGREGATOR_ACTOR_PATH);
    let searches = search_task.await.context("Search worker panicked")?;
    let retrievals = aggregator_task.await.context("Aggregator panicked")?;
    tracing::info!(searches, retrievals, "workers stopped");

    drop(reply_tx);
    writer_task.await.context("Reply writer panicked")?;

    tail_task.abort();
    let _ = tail_task.await;

    Ok(())
}
