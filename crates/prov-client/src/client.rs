use std::io::Read;
use std::path::Path;

use prov_core::{ClientConfig, ProgressReader, ProgressSink};

use crate::message::{MessageStream, ServerError};
use crate::transport::{HttpTransport, Transport, TransportError, UploadRequest};

/// Unversioned path of the build endpoint.
pub const BUILD_ENDPOINT: &str = "/engine";

/// Content type of the uploaded context.
pub const TAR_CONTENT_TYPE: &str = "application/x-tar";

/// Label of the upload progress line.
pub const UPLOAD_ACTION: &str = "Sending build context to prov engine";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Enginefile path inside the context, `/`-separated
    pub enginefile: String,
}

impl BuildOptions {
    pub fn for_specfile(relative_specfile: &Path) -> Self {
        let enginefile = relative_specfile
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Self { enginefile }
    }
}

/// Engine API client, parameterized over the transport for testability.
pub struct EngineClient<T: Transport = HttpTransport> {
    transport: T,
}

impl EngineClient<HttpTransport> {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        Ok(Self {
            transport: HttpTransport::new(config)?,
        })
    }
}

impl<T: Transport> EngineClient<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    /// Submit a context archive and open the response message stream.
    pub fn build(
        &self,
        body: Box<dyn Read + Send>,
        options: &BuildOptions,
    ) -> Result<MessageStream, ClientError> {
        tracing::info!(enginefile = %options.enginefile, "submitting build");
        let response = self.transport.post(UploadRequest {
            endpoint: BUILD_ENDPOINT.to_owned(),
            query: vec![("enginefile".to_owned(), options.enginefile.clone())],
            content_type: TAR_CONTENT_TYPE.to_owned(),
            body,
        })?;
        Ok(MessageStream::new(response))
    }

    /// [`build`](Self::build) with upload progress reported to `progress`.
    ///
    /// The total size is unknown: archives are produced while they are sent.
    pub fn upload<R, S>(
        &self,
        archive: R,
        relative_specfile: &Path,
        progress: S,
    ) -> Result<MessageStream, ClientError>
    where
        R: Read + Send + 'static,
        S: ProgressSink + 'static,
    {
        let body = ProgressReader::new(archive, progress, None, UPLOAD_ACTION);
        self.build(Box::new(body), &BuildOptions::for_specfile(relative_specfile))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to decode server message")]
    Decode { source: serde_json::Error },

    #[error("failed to write build output")]
    Output { source: std::io::Error },

    #[error(transparent)]
    Server(ServerError),
}
