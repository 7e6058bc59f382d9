use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Invalid or contradictory invocation configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("please specify only one -H (got {count})")]
    MultipleHosts { count: usize },

    #[error("unable to parse host `{host}`")]
    InvalidHost { host: String },

    #[error("unsupported protocol `{proto}` in host `{host}`; use tcp, http or https")]
    UnsupportedProtocol { proto: String, host: String },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
