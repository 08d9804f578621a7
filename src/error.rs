//! Error taxonomy shared by capture, DNN and reporting code

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{name}: buffer {index} is already queued (pool of {size})")]
    AlreadyQueued {
        name: String,
        index: usize,
        size: usize,
    },

    #[error("{0}: no buffer is currently queued")]
    NotQueued(String),

    #[error("{name}: invalid buffer index {index} (pool of {size})")]
    InvalidIndex {
        name: String,
        index: usize,
        size: usize,
    },

    #[error("not streaming")]
    NotStreaming,

    #[error("stream aborted")]
    Aborted,

    #[error("format error: {0}")]
    Format(String),

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("unsupported channel count {0} (need 1, 3 or 4)")]
    UnsupportedChannels(usize),

    #[error("unsupported tensor layout: {0}")]
    UnsupportedLayout(String),

    #[error("cannot map coordinates with zero-sized blob {0}x{1}")]
    ZeroBlobSize(u32, u32),

    #[error("quantization error: {0}")]
    Quantization(String),

    #[error("network not ready")]
    NotReady,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("parameter {name}: {reason}")]
    Param { name: String, reason: String },

    #[error("JPEG decode failed: {0}")]
    Jpeg(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    let mut out = format!("{} errors:", errors.len());
    for (i, e) in errors.iter().enumerate() {
        out.push_str(&format!(" [{}] {}", i + 1, e));
    }
    out
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Folds a set of task failures into one error. A single failure is
    /// returned as-is.
    pub fn combine(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// True for errors that mean the stream was cancelled or turned off.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Aborted | Self::NotStreaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_every_failure() {
        assert!(Error::combine(vec![]).is_none());

        let one = Error::combine(vec![Error::Aborted]).unwrap();
        assert!(matches!(one, Error::Aborted));

        let many = Error::combine(vec![Error::NotReady, Error::format("bad")]).unwrap();
        let text = many.to_string();
        assert!(text.starts_with("2 errors:"));
        assert!(text.contains("network not ready"));
        assert!(text.contains("format error: bad"));
    }
}
