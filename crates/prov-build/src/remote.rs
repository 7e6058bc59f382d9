use std::io::Read;

/// A remote resource opened for streaming.
pub struct Download {
    pub body: Box<dyn Read + Send>,
    /// From `Content-Length`, when the server sent one
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Opens a URL as a byte stream.
pub trait Downloader {
    fn download(&self, url: &str) -> Result<Download, DownloadError>;
}

/// Whether `s` is an http(s) URL.
pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// [`Downloader`] on a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| DownloadError::Client { source: e })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str) -> Result<Download, DownloadError> {
        tracing::debug!(url, "downloading remote context");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| DownloadError::Request {
                url: url.to_owned(),
                source: e,
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = match response.text() {
                Ok(body) => body,
                Err(e) => format!("<unreadable body: {e}>"),
            };
            return Err(DownloadError::Status {
                url: url.to_owned(),
                status: status.to_string(),
                body: body.trim().to_owned(),
            });
        }

        Ok(Download {
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to create HTTP client")]
    Client { source: reqwest::Error },
    #[error("unable to download remote context {url}")]
    Request { url: String, source: reqwest::Error },
    #[error("failed to GET {url} with status {status}: {body}")]
    Status {
        url: String,
        status: String,
        body: String,
    },
}
