//! Error types for mxpool.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mxpool.
#[derive(Error, Debug)]
pub enum MxpoolError {
    #[error("{0}")]
    Argument(String),

    #[error("cannot open file {}: {source}", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid matrix in {} at line {line}: '{token}' is not an integer", path.display())]
    InvalidMatrix {
        path: PathBuf,
        line: usize,
        token: String,
    },

    #[error("failed to spawn worker {index}: {reason}")]
    SpawnFailure { index: usize, reason: String },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MxpoolError {
    /// Wrap an I/O failure on `path` as a [`MxpoolError::FileOpen`].
    pub fn file_open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileOpen {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for mxpool operations.
pub type Result<T> = std::result::Result<T, MxpoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_file_open_error_names_file() {
        let err = MxpoolError::file_open(
            "missing/A.txt",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("cannot open file missing/A.txt"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_invalid_matrix_error_message() {
        let err = MxpoolError::InvalidMatrix {
            path: PathBuf::from("W1.txt"),
            line: 3,
            token: "x7".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("W1.txt"));
        assert!(msg.contains("line 3"));
        assert!(msg.contains("'x7'"));
    }

    #[test]
    fn test_spawn_failure_error_message() {
        let err = MxpoolError::SpawnFailure {
            index: 4,
            reason: "Resource temporarily unavailable".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("worker 4"));
        assert!(msg.contains("Resource temporarily unavailable"));
    }

    #[test]
    fn test_argument_message_passthrough() {
        let err = MxpoolError::Argument("expecting at least 2 files as input".to_string());
        assert_eq!(err.to_string(), "expecting at least 2 files as input");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: MxpoolError = io_err.into();
        let msg = err.to_string();
        assert!(msg.contains("IO error"));
        assert!(msg.contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: MxpoolError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(MxpoolError::Merge("row out of range".into()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
