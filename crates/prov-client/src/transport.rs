use std::io::Read;

use prov_core::ClientConfig;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use url::Url;

/// Value of the `User-Agent` header on every request.
pub const CLIENT_USER_AGENT: &str = concat!("prov-client/", env!("CARGO_PKG_VERSION"));

/// A streaming POST to the engine API.
pub struct UploadRequest {
    /// Unversioned endpoint, e.g. `/engine`
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub content_type: String,
    pub body: Box<dyn Read + Send>,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("endpoint", &self.endpoint)
            .field("query", &self.query)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Sends upload requests and hands back the response body as a stream.
///
/// Production code uses [`HttpTransport`], tests use mockall-generated mocks.
pub trait Transport {
    fn post(&self, request: UploadRequest) -> Result<Box<dyn Read + Send>, TransportError>;
}

/// [`Transport`] on a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: ClientConfig,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        // builds can run for a long time; the stream has no deadline
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()
            .map_err(|e| TransportError::Client { source: e })?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Full request URL: origin, base path, API version, endpoint and query.
    pub fn request_url(&self, endpoint: &str, query: &[(String, String)]) -> Result<Url, TransportError> {
        let raw = format!(
            "{origin}{path}",
            origin = self.config.host.origin(),
            path = self.config.api_path(endpoint)
        );
        let mut url = Url::parse(&raw).map_err(|e| TransportError::InvalidUrl {
            url: raw.clone(),
            source: e,
        })?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

impl Transport for HttpTransport {
    fn post(&self, request: UploadRequest) -> Result<Box<dyn Read + Send>, TransportError> {
        let url = self.request_url(&request.endpoint, &request.query)?;
        tracing::debug!(url = %url, content_type = %request.content_type, "posting");

        let mut builder = self
            .client
            .post(url.clone())
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(CONTENT_TYPE, request.content_type.as_str());
        for (name, value) in &self.config.http_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(reqwest::blocking::Body::new(request.body))
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    TransportError::Connect {
                        host: self.config.host.origin(),
                        source: e,
                    }
                } else {
                    TransportError::Request {
                        url: url.to_string(),
                        source: e,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text() {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!(error = %e, "failed to read error response body");
                    String::new()
                }
            };
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: server_error_message(&body),
            });
        }

        tracing::debug!(status = status.as_u16(), "response stream opened");
        Ok(Box::new(response))
    }
}

/// The `message` field of a JSON error body, or the trimmed body itself.
pub fn server_error_message(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.message,
        // arch-lint: allow(no-error-swallowing) reason="a non-JSON error body is shown as plain text"
        Err(_) => body.trim().to_owned(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create HTTP client")]
    Client { source: reqwest::Error },

    #[error("invalid request url {url}")]
    InvalidUrl { url: String, source: url::ParseError },

    #[error("cannot connect to the server at {host}. Is the engine running?")]
    Connect { host: String, source: reqwest::Error },

    #[error("error during connect to {url}")]
    Request { url: String, source: reqwest::Error },

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use prov_core::{ConfigFile, MapEnv};

    fn transport(host: &str, version: &str) -> HttpTransport {
        let env = MapEnv::new([("PROV_API_VERSION", version)]);
        let config = ClientConfig::resolve(&[host.to_owned()], &env, &ConfigFile::default()).unwrap();
        HttpTransport::new(config).unwrap()
    }

    #[test]
    fn url_carries_version_and_query() {
        let url = transport("tcp://engine.local:2375", "1.0")
            .request_url("/engine", &[("enginefile".to_owned(), "sub dir/Enginefile".to_owned())])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://engine.local:2375/v1.0/engine?enginefile=sub+dir%2FEnginefile"
        );
    }

    #[test]
    fn url_keeps_base_path() {
        let url = transport("https://example.com/prov/", "v2")
            .request_url("/engine", &[])
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/prov/v2/engine");
    }

    #[test]
    fn error_message_prefers_json_field() {
        assert_eq!(server_error_message(r#"{"message":"no such engine"}"#), "no such engine");
        assert_eq!(server_error_message("plain failure\n"), "plain failure");
    }

    #[test]
    fn user_agent_names_crate() {
        assert!(CLIENT_USER_AGENT.starts_with("prov-client/"));
    }
}
