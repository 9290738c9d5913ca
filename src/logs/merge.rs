//! K-way merge of log entries from many archives.
//!
//! Every selected log entry becomes one [`LogCursor`]. The merger keeps at
//! most one decoded record per cursor and a min-heap of their timestamps,
//! so memory stays proportional to the number of entries, not their size.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::io::{ByteStream, ObjectRef, ObjectStore};
use crate::zip::{ZipEntryMeta, ZipEntryStreamer, ZipIndex, ZipIndexResolver};

use super::lines::LineDecoder;
use super::record::LogRecord;

/// Entry prefix holding crawler logs inside a WACZ.
pub const DEFAULT_LOG_PREFIX: &str = "logs/";

/// Stream of merged records.
pub type LogStream = BoxStream<'static, Result<LogRecord>>;

/// Which entries of an archive hold logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySelector {
    /// Exactly these entries. Missing ones are skipped with a warning.
    Names(Vec<String>),
    /// Every file entry whose name starts with the prefix.
    Prefix(String),
}

impl Default for EntrySelector {
    fn default() -> Self {
        EntrySelector::Prefix(DEFAULT_LOG_PREFIX.to_string())
    }
}

impl EntrySelector {
    fn select(&self, index: &ZipIndex, object: &ObjectRef) -> Vec<ZipEntryMeta> {
        match self {
            EntrySelector::Names(names) => names
                .iter()
                .filter_map(|name| {
                    let found = index.find(name).cloned();
                    if found.is_none() {
                        warn!(%object, entry = %name, "log entry not in archive, skipping");
                    }
                    found
                })
                .collect(),
            EntrySelector::Prefix(prefix) => index.files_with_prefix(prefix).cloned().collect(),
        }
    }
}

/// One archive and the log entries to read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSource {
    pub object: ObjectRef,
    pub selector: EntrySelector,
}

impl LogSource {
    /// All entries under `logs/`.
    pub fn new(object: ObjectRef) -> Self {
        Self {
            object,
            selector: EntrySelector::default(),
        }
    }

    pub fn with_entries<I, N>(object: ObjectRef, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            object,
            selector: EntrySelector::Names(names.into_iter().map(Into::into).collect()),
        }
    }
}

/// Level and context filters. An empty set lets everything through.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub levels: HashSet<String>,
    pub contexts: HashSet<String>,
}

impl LogFilter {
    pub fn new<L, C>(levels: L, contexts: C) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            levels: levels.into_iter().map(Into::into).collect(),
            contexts: contexts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        (self.levels.is_empty() || self.levels.contains(&record.log_level))
            && (self.contexts.is_empty() || self.contexts.contains(&record.context))
    }
}

/// Counters shared between a merge and whoever wants to observe it.
#[derive(Debug, Clone, Default)]
pub struct MergeStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    dropped: AtomicU64,
    filtered: AtomicU64,
    emitted: AtomicU64,
}

impl MergeStats {
    /// Lines dropped because they were not valid log records.
    pub fn dropped_lines(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Valid records rejected by the filter.
    pub fn filtered_records(&self) -> u64 {
        self.inner.filtered.load(Ordering::Relaxed)
    }

    /// Records handed to the consumer.
    pub fn emitted_records(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A source of records in non-decreasing timestamp order.
#[async_trait]
pub trait LogCursor: Send {
    /// The next record, or `None` at end of input.
    async fn next_record(&mut self) -> Result<Option<LogRecord>>;
}

/// Cursor over one NDJSON entry of one archive. The entry is opened on the
/// first call.
struct EntryCursor<S: ObjectStore + ?Sized> {
    streamer: ZipEntryStreamer<S>,
    object: ObjectRef,
    central_directory_offset: u64,
    meta: ZipEntryMeta,
    stream: Option<ByteStream>,
    input_done: bool,
    decoder: LineDecoder,
    ready: VecDeque<Vec<u8>>,
    filter: Arc<LogFilter>,
    stats: MergeStats,
}

#[async_trait]
impl<S: ObjectStore + ?Sized + 'static> LogCursor for EntryCursor<S> {
    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                match LogRecord::from_line(&line) {
                    Ok(record) if self.filter.matches(&record) => return Ok(Some(record)),
                    Ok(_) => MergeStats::bump(&self.stats.inner.filtered),
                    Err(err) => {
                        warn!(
                            object = %self.object,
                            entry = %self.meta.name,
                            error = %err,
                            line = %String::from_utf8_lossy(&line),
                            "dropping malformed log line"
                        );
                        MergeStats::bump(&self.stats.inner.dropped);
                    }
                }
                continue;
            }
            if self.input_done {
                return Ok(None);
            }

            if self.stream.is_none() {
                let stream = self
                    .streamer
                    .open_entry(&self.object, self.central_directory_offset, &self.meta)
                    .await?;
                self.stream = Some(stream);
            }
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };

            match stream.try_next().await? {
                Some(chunk) => self.ready.extend(self.decoder.push(&chunk)),
                None => {
                    self.input_done = true;
                    self.stream = None;
                    self.ready.extend(self.decoder.finish());
                    debug!(object = %self.object, entry = %self.meta.name, "log entry exhausted");
                }
            }
        }
    }
}

/// Pull-based N-way merge over [`LogCursor`]s.
///
/// Records come out in non-decreasing timestamp order provided every
/// cursor is itself ordered. Ties go to the cursor added first.
pub struct LogMerger {
    cursors: Vec<Box<dyn LogCursor>>,
    heads: Vec<Option<LogRecord>>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, usize)>>,
    primed: bool,
    refill: Option<usize>,
    stats: MergeStats,
}

impl LogMerger {
    pub fn new(cursors: Vec<Box<dyn LogCursor>>) -> Self {
        Self::with_stats(cursors, MergeStats::default())
    }

    fn with_stats(cursors: Vec<Box<dyn LogCursor>>, stats: MergeStats) -> Self {
        let heads = cursors.iter().map(|_| None).collect();
        Self {
            heap: BinaryHeap::with_capacity(cursors.len()),
            cursors,
            heads,
            primed: false,
            refill: None,
            stats,
        }
    }

    /// Handle on this merge's counters.
    pub fn stats(&self) -> MergeStats {
        self.stats.clone()
    }

    /// The next record in timestamp order.
    pub async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if !self.primed {
            let firsts = try_join_all(self.cursors.iter_mut().map(|c| c.next_record())).await?;
            for (idx, first) in firsts.into_iter().enumerate() {
                self.set_head(idx, first);
            }
            self.primed = true;
        }
        if let Some(idx) = self.refill.take() {
            let next = self.cursors[idx].next_record().await?;
            self.set_head(idx, next);
        }

        let Some(Reverse((_, idx))) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill = Some(idx);
        let record = self.heads[idx].take();
        if record.is_some() {
            MergeStats::bump(&self.stats.inner.emitted);
        }
        Ok(record)
    }

    fn set_head(&mut self, idx: usize, record: Option<LogRecord>) {
        if let Some(record) = record {
            self.heap.push(Reverse((record.timestamp, idx)));
            self.heads[idx] = Some(record);
        }
    }

    /// The merge as a lazy stream of records.
    pub fn into_stream(self) -> LogStream {
        futures::stream::try_unfold(self, |mut merger| async move {
            let record = merger.next_record().await?;
            Ok::<_, Error>(record.map(|record| (record, merger)))
        })
        .boxed()
    }

    /// The merge rendered as newline-delimited JSON.
    pub fn into_ndjson(self) -> ByteStream {
        self.into_stream()
            .map(|item| {
                item.and_then(|record| Ok(Bytes::from(record.to_json_line()?)))
            })
            .boxed()
    }

    /// Run the merge on its own task, handing records over through a
    /// channel of `capacity` slots. Dropping the returned stream stops the
    /// task at its next send. Must be called from inside a tokio runtime.
    pub fn spawn(self, capacity: usize) -> LogStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            let mut merger = self;
            loop {
                let item = merger.next_record().await;
                let stop = !matches!(item, Ok(Some(_)));
                let Some(item) = item.transpose() else {
                    break;
                };
                if tx.send(item).await.is_err() {
                    debug!("log merge consumer went away");
                    break;
                }
                if stop {
                    break;
                }
            }
        });
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
            .boxed()
    }
}

/// Merge the logs of `sources` into one timestamp-ordered sequence.
///
/// Every archive index is resolved up front, so structural errors (missing
/// object, broken zip) fail here. Entries themselves are opened lazily as
/// the merge is polled. Malformed lines are skipped and counted in
/// [`LogMerger::stats`].
pub async fn merge_filtered_logs<S>(
    store: Arc<S>,
    sources: &[LogSource],
    filter: LogFilter,
) -> Result<LogMerger>
where
    S: ObjectStore + ?Sized + 'static,
{
    let resolver = ZipIndexResolver::new(Arc::clone(&store));
    let streamer = ZipEntryStreamer::new(store);
    let indexes = try_join_all(sources.iter().map(|s| resolver.resolve_index(&s.object))).await?;

    let filter = Arc::new(filter);
    let stats = MergeStats::default();
    let mut cursors: Vec<Box<dyn LogCursor>> = Vec::new();
    for (source, index) in sources.iter().zip(&indexes) {
        for meta in source.selector.select(index, &source.object) {
            cursors.push(Box::new(EntryCursor {
                streamer: streamer.clone(),
                object: source.object.clone(),
                central_directory_offset: index.central_directory_offset,
                meta,
                stream: None,
                input_done: false,
                decoder: LineDecoder::new(),
                ready: VecDeque::new(),
                filter: Arc::clone(&filter),
                stats: stats.clone(),
            }));
        }
    }

    info!(
        sources = sources.len(),
        entries = cursors.len(),
        levels = filter.levels.len(),
        contexts = filter.contexts.len(),
        "merging archive logs"
    );
    Ok(LogMerger::with_stats(cursors, stats))
}
