//! Journal of accepted signals and a resumable tail over it.
//!
//! Every signal the concierge accepts is appended to a [`Journal`]. Observers
//! follow it with [`tail_journal`], a
//! [`ResumableSource`](controlflow::ResumableSource) whose seed is the next
//! journal offset to read. When a read cursor dies, the tail resumes right
//! after the last entry it emitted, so nothing is skipped or repeated.
//!
//! ```ignore
//! let journal = Arc::new(MemoryJournal::new());
//! let mut tail = tail_journal(journal.clone(), &settings, 0)?;
//!
//! journal.append(signal);
//! let entry = tail.next().await.unwrap()?;
//! ```

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use controlflow::{FlowError, ResumableSource, ResumeSettings};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::signal::Signal;

/// One journaled signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    /// Offset in the journal, starting at 0.
    pub seq: u64,
    pub signal: Signal,
    pub recorded_at: DateTime<Utc>,
}

/// An append-only log that can be read from any offset.
pub trait Journal: Send + Sync {
    /// Stream entries starting at `offset`, following new appends.
    ///
    /// The stream may fail at any point; readers resume from the next offset.
    fn read_from(&self, offset: u64) -> BoxStream<'static, anyhow::Result<JournalEntry>>;
}

impl<J: Journal + ?Sized> Journal for Arc<J> {
    fn read_from(&self, offset: u64) -> BoxStream<'static, anyhow::Result<JournalEntry>> {
        (**self).read_from(offset)
    }
}

// =============================================================================
// Memory Journal
// =============================================================================

/// In-process journal.
///
/// With a cursor limit, every read stream fails after serving that many
/// entries, the way server-side cursors time out.
pub struct MemoryJournal {
    entries: Arc<RwLock<Vec<JournalEntry>>>,
    appended: watch::Sender<u64>,
    cursor_limit: Option<usize>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            appended,
            cursor_limit: None,
        }
    }

    /// Fail each read stream after `limit` entries. `None` disables the limit.
    pub fn with_cursor_limit(mut self, limit: Option<usize>) -> Self {
        self.cursor_limit = limit;
        self
    }

    /// Append `signal` and return its offset.
    pub fn append(&self, signal: Signal) -> u64 {
        let seq = {
            let mut entries = write(&self.entries);
            let seq = entries.len() as u64;
            entries.push(JournalEntry {
                seq,
                signal,
                recorded_at: Utc::now(),
            });
            seq
        };
        self.appended.send_replace(seq + 1);
        seq
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Cursor {
    next: u64,
    served: usize,
    appended: watch::Receiver<u64>,
}

impl Journal for MemoryJournal {
    fn read_from(&self, offset: u64) -> BoxStream<'static, anyhow::Result<JournalEntry>> {
        let entries = self.entries.clone();
        let limit = self.cursor_limit;
        // Subscribe before the first read so no append is missed
        let cursor = Cursor {
            next: offset,
            served: 0,
            appended: self.appended.subscribe(),
        };

        stream::unfold(Some(cursor), move |cursor| {
            let entries = entries.clone();
            async move {
                let mut cursor = cursor?;
                if limit.is_some_and(|limit| cursor.served >= limit) {
                    let err = anyhow!("cursor expired after {} entries", cursor.served);
                    return Some((Err(err), None));
                }
                loop {
                    let entry = usize::try_from(cursor.next)
                        .ok()
                        .and_then(|i| read(&entries).get(i).cloned());
                    if let Some(entry) = entry {
                        cursor.next += 1;
                        cursor.served += 1;
                        return Some((Ok(entry), Some(cursor)));
                    }
                    if cursor.appended.changed().await.is_err() {
                        // journal dropped, nothing more will ever arrive
                        return None;
                    }
                }
            }
        })
        .boxed()
    }
}

// =============================================================================
// Tail
// =============================================================================

/// Follow `journal` from offset `start`, surviving cursor failures.
///
/// Backoff and restart budget come from `settings`; only the last emitted
/// entry is remembered, since the next offset is derived from it alone.
pub fn tail_journal<J>(
    journal: J,
    settings: &ResumeSettings,
    start: u64,
) -> Result<ResumableSource<u64, JournalEntry>, FlowError>
where
    J: Journal + 'static,
{
    ResumableSource::builder(start)
        .name("journal-tail")
        .settings(settings)
        .look_behind(1)
        .resume(move |offset| {
            debug!(offset, "opening journal cursor");
            journal.read_from(offset)
        })
        .next_seed(move |last: Vec<JournalEntry>| {
            last.last().map_or(start, |entry| entry.seq + 1)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search(n: usize) -> Signal {
        Signal::ThingSearch {
            filter: Some(format!("eq(attributes/n,{})", n)),
            namespaces: vec![],
        }
    }

    fn fast_settings() -> ResumeSettings {
        ResumeSettings {
            min_backoff_ms: 10,
            max_backoff_ms: 100,
            max_restarts: -1,
            recovery_period_ms: 1_000,
            look_behind: 1,
        }
    }

    #[tokio::test]
    async fn test_read_from_offset_follows_appends() {
        let journal = MemoryJournal::new();
        journal.append(search(0));
        journal.append(search(1));

        let mut reader = journal.read_from(1);
        assert_eq!(reader.next().await.unwrap().unwrap().seq, 1);

        journal.append(search(2));
        assert_eq!(reader.next().await.unwrap().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_cursor_limit_fails_stream() {
        let journal = MemoryJournal::new().with_cursor_limit(Some(2));
        for n in 0..5 {
            journal.append(search(n));
        }

        let items: Vec<_> = journal.read_from(0).collect().await;

        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_resumes_without_gaps_or_repeats() {
        let journal = Arc::new(MemoryJournal::new().with_cursor_limit(Some(3)));
        for n in 0..10 {
            journal.append(search(n));
        }

        let tail = tail_journal(journal.clone(), &fast_settings(), 0).unwrap();
        let seqs: Vec<u64> = tail
            .take(10)
            .map(|entry| entry.unwrap().seq)
            .collect()
            .await;

        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_gives_up_when_budget_is_spent() {
        let journal = Arc::new(MemoryJournal::new().with_cursor_limit(Some(0)));
        journal.append(search(0));
        let settings = ResumeSettings {
            max_restarts: 2,
            ..fast_settings()
        };

        let tail = tail_journal(journal, &settings, 0).unwrap();
        let items: Vec<_> = tail.collect().await;

        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().is_exhausted());
    }

    #[test]
    fn test_tail_rejects_bad_settings() {
        let settings = ResumeSettings {
            min_backoff_ms: 10_000,
            max_backoff_ms: 1,
            ..fast_settings()
        };

        let err = tail_journal(MemoryJournal::new(), &settings, 0).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_tail_ignores_configured_look_behind() {
        let settings = ResumeSettings {
            look_behind: -1,
            ..fast_settings()
        };

        let tail = tail_journal(Arc::new(MemoryJournal::new()), &settings, 0).unwrap();
        assert_eq!(tail.restarts(), 0);
    }
}
