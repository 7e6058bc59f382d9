use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Host used when neither `-H`, `PROV_HOST` nor the config file name one.
pub const DEFAULT_HOST: &str = "http://localhost";

/// Version of the current stable API.
pub const DEFAULT_API_VERSION: &str = "1.0";

pub const HOST_ENV: &str = "PROV_HOST";
pub const API_VERSION_ENV: &str = "PROV_API_VERSION";
pub const CONFIG_ENV: &str = "PROV_CONFIG";

/// Read access to environment variables.
///
/// The CLI resolves configuration once through [`ProcessEnv`]; tests inject
/// a [`MapEnv`] so nothing below the entry point touches the real process
/// environment.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        // arch-lint: allow(no-silent-result-drop) reason="an unset or non-unicode variable means the default applies"
        std::env::var(key).ok()
    }
}

/// In-memory environment, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct MapEnv(pub HashMap<String, String>);

impl MapEnv {
    pub fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl EnvSource for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Optional `config.toml` with client defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Server address, e.g. `tcp://build.internal:2375`
    pub host: Option<String>,
    /// API version to request
    pub api_version: Option<String>,
    /// Extra headers sent with every request
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
}

impl ConfigFile {
    /// Load from `path`, or return defaults if the file does not exist.
    pub fn load(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| crate::Error::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| crate::Error::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// `PROV_CONFIG` if set, otherwise `~/.prov/config.toml`.
    pub fn default_path(env: &dyn EnvSource) -> Option<PathBuf> {
        if let Some(path) = env.var(CONFIG_ENV).filter(|p| !p.trim().is_empty()) {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|home| home.join(".prov").join("config.toml"))
    }
}

/// A parsed `proto://addr[/base]` server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub proto: String,
    pub addr: String,
    pub base_path: String,
}

impl HostSpec {
    /// Parse a host string. Only `tcp`, `http` and `https` are reachable
    /// over the HTTP transport; `tcp` is spoken as plain http.
    pub fn parse(host: &str) -> crate::Result<Self> {
        let Some((proto, rest)) = host.split_once("://") else {
            return Err(crate::Error::InvalidHost {
                host: host.to_owned(),
            });
        };

        if !matches!(proto, "tcp" | "http" | "https") {
            return Err(crate::Error::UnsupportedProtocol {
                proto: proto.to_owned(),
                host: host.to_owned(),
            });
        }

        let (addr, base_path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].trim_end_matches('/')),
            None => (rest, ""),
        };

        if addr.is_empty() {
            return Err(crate::Error::InvalidHost {
                host: host.to_owned(),
            });
        }

        Ok(Self {
            proto: proto.to_owned(),
            addr: addr.to_owned(),
            base_path: base_path.to_owned(),
        })
    }

    /// Scheme and authority, without the base path.
    pub fn origin(&self) -> String {
        let scheme = if self.proto == "https" { "https" } else { "http" };
        format!("{scheme}://{addr}", addr = self.addr)
    }
}

/// Client settings, resolved once at invocation start and passed down
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: HostSpec,
    pub api_version: String,
    pub http_headers: BTreeMap<String, String>,
}

impl ClientConfig {
    /// Resolve the effective configuration.
    ///
    /// Host: `-H` flag (at most one) > `PROV_HOST` > config file > default.
    /// Version: `PROV_API_VERSION` > config file > default.
    pub fn resolve(
        hosts: &[String],
        env: &dyn EnvSource,
        file: &ConfigFile,
    ) -> crate::Result<Self> {
        let host = match hosts {
            [] => layered(env.var(HOST_ENV), file.host.as_deref(), DEFAULT_HOST),
            [one] => one.clone(),
            many => {
                return Err(crate::Error::MultipleHosts { count: many.len() });
            }
        };

        let api_version = layered(
            env.var(API_VERSION_ENV),
            file.api_version.as_deref(),
            DEFAULT_API_VERSION,
        );

        let config = Self {
            host: HostSpec::parse(&host)?,
            api_version,
            http_headers: file.http_headers.clone(),
        };

        tracing::debug!(
            host = %config.host.origin(),
            base_path = %config.host.base_path,
            api_version = %config.api_version,
            headers = config.http_headers.len(),
            "client config resolved"
        );
        Ok(config)
    }

    /// Versioned request path for an API endpoint, e.g. `/v1.0/engine`.
    pub fn api_path(&self, endpoint: &str) -> String {
        let version = self.api_version.trim_start_matches('v');
        if version.is_empty() {
            format!("{base}{endpoint}", base = self.host.base_path)
        } else {
            format!("{base}/v{version}{endpoint}", base = self.host.base_path)
        }
    }
}

/// A non-empty environment value, else the config file value, else `default`.
fn layered(env_value: Option<String>, file_value: Option<&str>, default: &str) -> String {
    match (env_value, file_value) {
        (Some(value), _) if !value.is_empty() => value,
        (_, Some(value)) => value.to_owned(),
        _ => default.to_owned(),
    }
}
