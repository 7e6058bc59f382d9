//! Core types and configuration for prov.
//!
//! This crate defines the client configuration ([`ClientConfig`]) resolved
//! once per invocation, the progress model shared by downloads and uploads,
//! and the constants every other crate agrees on.

pub mod config;
pub mod error;
pub mod progress;

pub use config::{ClientConfig, ConfigFile, EnvSource, HostSpec, MapEnv, ProcessEnv};
pub use error::{Error, Result};
pub use progress::{
    BarProgress, LastOnly, ProgressEvent, ProgressReader, ProgressSink, SharedBuffer, TextProgress,
};

/// Default name of the build-specification file inside a context.
pub const DEFAULT_ENGINEFILE_NAME: &str = "Enginefile";

/// Name of the ignore file read from the root of a context directory.
pub const IGNORE_FILE_NAME: &str = ".provignore";
