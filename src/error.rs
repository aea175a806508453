use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QfsError {
    #[error("{path}: no such file or directory")]
    NotFound { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{path}: {source}")]
    PathIo {
        path: String,
        source: std::io::Error,
    },

    #[error("{filename}: offset {offset}: {message}")]
    Format {
        filename: String,
        offset: u64,
        message: String,
    },

    #[error("{}:{}: {}", .file.display(), .line, .message)]
    FilterLoad {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("filter: {0}")]
    Filter(String),

    #[error("{op} {uri}: {message}")]
    Store {
        op: String,
        uri: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, QfsError>;

impl QfsError {
    /// Canonical "does not exist" test; callers probing optional paths
    /// should use this rather than matching variants.
    pub fn is_not_found(&self) -> bool {
        match self {
            QfsError::NotFound { .. } => true,
            QfsError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            QfsError::PathIo { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn path_io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            QfsError::NotFound { path }
        } else {
            QfsError::PathIo { path, source }
        }
    }

    pub fn format(filename: impl Into<String>, offset: u64, message: impl Into<String>) -> Self {
        QfsError::Format {
            filename: filename.into(),
            offset,
            message: message.into(),
        }
    }

    pub fn store(op: impl Into<String>, uri: impl Into<String>, message: impl ToString) -> Self {
        QfsError::Store {
            op: op.into(),
            uri: uri.into(),
            message: message.to_string(),
        }
    }
}
