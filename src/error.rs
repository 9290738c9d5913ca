//! Error handling for wacz-stream.
//!
//! Every fallible operation in the library returns [`Result`]. The variants
//! mirror the ways a remote archive operation can fail: the object is gone,
//! the requested bytes are out of bounds, the zip structure is broken, the
//! entry uses a compression method we cannot decode, the store or network
//! misbehaved, or a multipart upload had to be rolled back.

use std::io;
use thiserror::Error;

/// Boxed error used to carry causes from the HTTP and SDK layers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can happen when reading, merging, packaging or uploading.
#[derive(Error, Debug)]
pub enum Error {
    /// The addressed object does not exist in the store.
    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// The requested byte range lies (partly) beyond the end of the object.
    #[error("range {range} not satisfiable for {key} ({size:?} bytes)")]
    RangeUnsatisfiable {
        key: String,
        range: String,
        size: Option<u64>,
    },

    /// The archive has no member with this name.
    #[error("{archive} has no entry named {name}")]
    EntryNotFound { archive: String, name: String },

    /// The zip structure is absent, truncated or internally inconsistent.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// The entry is compressed with something other than STORED or DEFLATE.
    #[error("unsupported compression method {method} for entry {name}")]
    UnsupportedCompression { name: String, method: u16 },

    /// Network or service level failure. The caller may retry.
    #[error("transient I/O error: {message}")]
    TransientIo {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A multipart upload failed and the session was rolled back.
    ///
    /// `abort_error` is set when the abort call itself failed; the original
    /// failure is always kept in `source`.
    #[error("multipart upload {upload_id} aborted{}", abort_suffix(.abort_error))]
    UploadAborted {
        upload_id: String,
        #[source]
        source: Box<Error>,
        abort_error: Option<Box<Error>>,
    },

    /// Invalid configuration or argument supplied by the caller.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON encoding failure (manifest or log output).
    #[error("serialization error")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

fn abort_suffix(abort_error: &Option<Box<Error>>) -> String {
    match abort_error {
        Some(err) => format!(" (abort also failed: {err})"),
        None => String::new(),
    }
}

impl Error {
    /// Build a [`Error::TransientIo`] from a message and an underlying cause.
    pub fn transient<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::TransientIo {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Build a [`Error::MalformedArchive`].
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedArchive(message.into())
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientIo { .. })
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                Error::MalformedArchive(err.to_string())
            }
            _ => Error::transient("I/O failure", err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::transient("HTTP request failed", err)
    }
}

/// Result type alias for wacz-stream operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::transient("boom", "cause").is_retryable());
        assert!(!Error::malformed("bad").is_retryable());
        assert!(
            !Error::ObjectNotFound {
                bucket: "b".into(),
                key: "k".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn truncated_reads_are_structural() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, Error::MalformedArchive(_)));
    }

    #[test]
    fn upload_aborted_mentions_abort_failure() {
        let err = Error::UploadAborted {
            upload_id: "u-1".into(),
            source: Box::new(Error::transient("part 3 failed", "timeout")),
            abort_error: Some(Box::new(Error::transient("abort failed", "timeout"))),
        };
        let text = err.to_string();
        assert!(text.contains("u-1"));
        assert!(text.contains("abort also failed"));
    }
}
