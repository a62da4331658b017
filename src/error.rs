use std::path::PathBuf;

/// How an error should be treated by whoever drives the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or similar hiccup, running the job again may succeed.
    Transient,
    /// Retrying with the same inputs will fail the same way.
    Fatal,
}

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("invalid artifact path {path:?}, expected entity/project/name:alias")]
    MalformedArtifactPath { path: String },

    #[error("artifact {name}:{alias} not found under {root:?}")]
    ArtifactNotFound {
        name: String,
        alias: String,
        root: PathBuf,
    },

    #[error("artifact {name} has type {got}, expected {expected}")]
    ArtifactTypeMismatch {
        name: String,
        expected: String,
        got: String,
    },

    #[error("invalid run id {id:?}, expected lowercase letters and digits")]
    MalformedRunId { id: String },

    #[error("run {id} is not tracked under {root:?}")]
    RunNotFound { id: String, root: PathBuf },

    #[error("cannot split {requested} images evenly across {devices} devices")]
    InvalidBatchSize { requested: usize, devices: usize },

    #[error("cannot select top {k} out of {candidates} candidates")]
    InvalidTopK { k: usize, candidates: usize },

    #[error("malformed generation output: {0}")]
    MalformedGeneration(String),

    #[error("strip composition failed: {0}")]
    Strip(String),

    #[error("no device available: {0}")]
    NoDevice(String),

    /// User generated error message, typically created via `bail!`.
    #[error("{0}")]
    Msg(String),

    #[error("{context}\n{inner}")]
    Context {
        inner: Box<Self>,
        context: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn msg(err: impl std::fmt::Display) -> Self {
        Self::Msg(err.to_string())
    }

    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }

    pub fn context(self, c: impl std::fmt::Display) -> Self {
        Self::Context {
            inner: Box::new(self),
            context: c.to_string(),
        }
    }

    /// Classifies the failure, looking through any context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Hub(_) => ErrorKind::Transient,
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::WouldBlock => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            Self::Context { inner, .. } => inner.kind(),
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()))
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_looks_through_context() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.kind(), ErrorKind::Transient);
        let err = err.context("fetching artifact");
        assert!(err.is_transient());

        let err = Error::InvalidBatchSize {
            requested: 30,
            devices: 8,
        }
        .context("generating");
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
