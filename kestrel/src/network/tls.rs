//! The TLS layer of driver connections.
//!
//! The driver does not ship a TLS backend. Users plug one in by implementing
//! [`TlsContext`], which wraps a freshly connected TCP stream into an encrypted
//! one. The handshake runs before protocol negotiation, so every frame of the
//! connection (OPTIONS included) goes through the encrypted stream.

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A byte stream a connection can run over once the TLS handshake is done.
pub trait TlsStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TlsStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A user-provided TLS backend, shared by all connections of a session.
///
/// ```
/// # use std::net::SocketAddr;
/// # use async_trait::async_trait;
/// # use tokio::net::TcpStream;
/// # use kestrel::{TlsContext, TlsError, TlsStream};
/// #[derive(Debug)]
/// struct Plaintext;
///
/// #[async_trait]
/// impl TlsContext for Plaintext {
///     async fn connect(
///         &self,
///         _address: SocketAddr,
///         stream: TcpStream,
///     ) -> Result<Box<dyn TlsStream>, TlsError> {
///         Ok(Box::new(stream))
///     }
/// }
/// ```
#[async_trait]
pub trait TlsContext: Debug + Send + Sync {
    /// Performs the client side of the handshake over `stream`, connected to `address`.
    async fn connect(
        &self,
        address: SocketAddr,
        stream: TcpStream,
    ) -> Result<Box<dyn TlsStream>, TlsError>;
}

/// An error reported by a [`TlsContext`] implementation.
#[derive(Debug, thiserror::Error, Clone)]
#[error("TLS handshake failed: {0}")]
pub struct TlsError(pub Arc<dyn std::error::Error + Send + Sync>);

impl TlsError {
    /// Wraps any backend error.
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        TlsError(Arc::new(err))
    }
}
