//! Transport: the seam between sessions and the endpoint under test.
//!
//! The session engine never touches sockets directly. It drives a [`Connection`]
//! obtained from a [`Transport`]: send text frames, await the next inbound frame,
//! close. Two implementations ship with the crate:
//!
//! - [`ws::WsTransport`]: a real websocket client built on `tokio-tungstenite`.
//! - [`memory::MemoryHub`]: an in-process chat room used by tests and dry runs.

pub mod memory;
pub mod ws;

pub use memory::MemoryHub;
pub use ws::WsTransport;

use std::future::Future;

use crate::error::TransportError;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Opens connections to an endpoint.
///
/// A transport is shared by every session of a run, so it must be cheap to call
/// concurrently. Heavy resources (TLS configs, connection pools) belong in the
/// transport, never in the per-session path.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// A live, exclusively owned connection.
///
/// `recv` must be cancel safe: sessions race it against their timers and drop the
/// losing future.
pub trait Connection: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound frame. `None` means the peer closed the stream.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Frame, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
