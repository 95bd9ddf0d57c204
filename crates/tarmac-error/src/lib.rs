use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for tarmac-index operations.
///
/// Structured variants for the cases callers dispatch on (open-time
/// validation, undefined data, range failures), with free-form detail where
/// the caller can only report.
#[derive(Error, Debug)]
pub enum TarmacError {
    // === I/O ===
    /// Arena or trace file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Short read against the index file.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === Open-time validation ===
    /// The file is not an index file, or was written by an incompatible
    /// version of the software.
    #[error("not a usable index file (wrong magic number): '{path}'")]
    BadMagic { path: PathBuf },

    /// The index file was never finished: its header lacks the COMPLETE flag.
    #[error("index file is incomplete: '{path}'")]
    Incomplete { path: PathBuf },

    // === Structural ===
    /// An offset resolved to a structurally invalid record.
    #[error("index file is malformed: {detail}")]
    CorruptIndex { detail: String },

    // === Query ===
    /// A query asked for bytes the index does not know.
    #[error("undefined contents: {what}")]
    Undefined { what: String },

    /// A query index or parameter is past the end of the data.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: String, value: u64 },

    // === Indexing ===
    /// The trace input violated the format the indexer relies on.
    #[error("trace parse error at line {line}: {detail}")]
    Parse { line: u32, detail: String },

    /// An index built with optional subsystems disabled may not be kept on
    /// disk.
    #[error("index with disabled subsystems must not be persisted")]
    NotPersistable,

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl TarmacError {
    /// Create a corrupt-index error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptIndex {
            detail: detail.into(),
        }
    }

    /// Create a parse error at a trace line.
    pub fn parse(line: u32, detail: impl Into<String>) -> Self {
        Self::Parse {
            line,
            detail: detail.into(),
        }
    }

    /// Create an undefined-contents error.
    pub fn undefined(what: impl Into<String>) -> Self {
        Self::Undefined { what: what.into() }
    }

    /// Create an out-of-range error.
    pub fn out_of_range(what: impl Into<String>, value: u64) -> Self {
        Self::OutOfRange {
            what: what.into(),
            value,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error was produced by open-time validation, i.e. the
    /// file itself is unusable rather than the query being wrong.
    pub const fn is_open_failure(&self) -> bool {
        matches!(self, Self::BadMagic { .. } | Self::Incomplete { .. })
    }

    /// Whether the failing operation may be retried against a different
    /// query without re-opening the index.
    pub const fn is_query_failure(&self) -> bool {
        matches!(self, Self::Undefined { .. } | Self::OutOfRange { .. })
    }
}

/// Result type alias using `TarmacError`.
pub type Result<T> = std::result::Result<T, TarmacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TarmacError::corrupt("tree node offset past end of file");
        assert_eq!(
            err.to_string(),
            "index file is malformed: tree node offset past end of file"
        );
    }

    #[test]
    fn error_display_parse() {
        let err = TarmacError::parse(42, "byte position went backwards");
        assert_eq!(
            err.to_string(),
            "trace parse error at line 42: byte position went backwards"
        );
    }

    #[test]
    fn error_display_out_of_range() {
        let err = TarmacError::out_of_range("visible line index", 9000);
        assert_eq!(err.to_string(), "visible line index out of range: 9000");
    }

    #[test]
    fn open_failure_predicate() {
        let err = TarmacError::BadMagic {
            path: PathBuf::from("trace.tarmac.index"),
        };
        assert!(err.is_open_failure());
        assert!(!err.is_query_failure());

        let err = TarmacError::Incomplete {
            path: PathBuf::from("trace.tarmac.index"),
        };
        assert!(err.is_open_failure());
    }

    #[test]
    fn query_failure_predicate() {
        assert!(TarmacError::undefined("register r0").is_query_failure());
        assert!(TarmacError::out_of_range("line", 1).is_query_failure());
        assert!(!TarmacError::internal("bug").is_query_failure());
        assert!(!TarmacError::NotPersistable.is_query_failure());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: TarmacError = io_err.into();
        assert!(matches!(err, TarmacError::Io(_)));
    }

    #[test]
    fn convenience_constructors() {
        let err = TarmacError::parse(7, "unexpected token");
        assert!(matches!(err, TarmacError::Parse { line: 7, .. }));

        let err = TarmacError::undefined("memory at 0x1000");
        assert!(matches!(err, TarmacError::Undefined { .. }));

        let err = TarmacError::internal("assertion failed");
        assert!(matches!(err, TarmacError::Internal(msg) if msg == "assertion failed"));
    }
}
