//! Client for the prov engine build API.
//!
//! [`EngineClient`] posts a context archive to `/v{version}/engine` and
//! returns the response as a [`MessageStream`]; [`display_messages`]
//! renders it and turns the first error record into a [`ServerError`].
//! The HTTP layer sits behind the [`Transport`] trait.

pub mod client;
pub mod message;
pub mod transport;

pub use client::{BuildOptions, ClientError, EngineClient};
pub use message::{
    ErrorDetail, MessageStream, ProgressDetail, ServerError, ServerMessage, display_messages,
};
pub use transport::{HttpTransport, Transport, TransportError, UploadRequest};
