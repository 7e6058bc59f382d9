mod build;

pub use build::{BuildArgs, build};

/// A failure that carries its own process exit code.
#[derive(Debug, thiserror::Error)]
#[error("{status}")]
pub struct StatusError {
    pub status: String,
    pub code: i32,
}
