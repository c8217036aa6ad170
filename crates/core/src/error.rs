use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {path:?}")]
    NotFound { path: PathBuf },

    #[error("already exists: {path:?}")]
    AlreadyExists { path: PathBuf },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("crypto worker connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("crypto worker protocol error: {message}")]
    Protocol { message: String },

    #[error("job not found: {selector}")]
    JobNotFound { selector: String },

    #[error("duplicate job: {message}")]
    DuplicateJob { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}
