use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },
    #[error("lock protocol stalled on {} after {waited:?}", path.display())]
    LockStall { path: PathBuf, waited: Duration },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
}

impl Error {
    pub(crate) fn open(path: impl Into<PathBuf>, source: Error) -> Self {
        Error::Open {
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// True for errors that mean a lock poll gave up rather than failed.
    pub fn is_stall(&self) -> bool {
        matches!(self, Error::LockStall { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
