//! Filtered, chronologically merged logs from WACZ archives.

mod lines;
mod merge;
mod record;

pub use lines::LineDecoder;
pub use merge::{
    DEFAULT_LOG_PREFIX, EntrySelector, LogCursor, LogFilter, LogMerger, LogSource, LogStream,
    MergeStats, merge_filtered_logs,
};
pub use record::{LogRecord, RecordError};
