use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures a pipeline step can surface to the executor.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("consistency error: {0}")]
    Consistency(String),
    #[error("fit error: {0}")]
    Fit(String),
    #[error("computation error: {0}")]
    Compute(String),
}

impl PipelineError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn parse(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    /// Consistency errors come from mismatched artifacts; re-running the
    /// same step against the same files cannot fix them.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Consistency(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Parse { .. } => "parse",
            Self::Schema(_) => "schema",
            Self::Consistency(_) => "consistency",
            Self::Fit(_) => "fit",
            Self::Compute(_) => "compute",
        }
    }
}

pub type StepResult<T> = Result<T, PipelineError>;
