use std::{io::ErrorKind, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};

use super::{Connection, Frame, Transport};
use crate::error::TransportError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Websocket client transport.
#[derive(Debug, Clone)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for WsTransport {
    type Connection = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection, TransportError> {
        match tokio::time::timeout(self.connect_timeout, connect_async(url)).await {
            Ok(Ok((stream, _response))) => Ok(WsConnection { stream }),
            Ok(Err(e)) => Err(map_error(e)),
            Err(_) => Err(TransportError::Timeout(self.connect_timeout)),
        }
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text)).await.map_err(map_error)
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(Frame::Binary(bytes))),
                Ok(Message::Close(_)) => return None,
                // control frames are answered by tungstenite itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(map_error(e))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // an unanswered close handshake still ends the session gracefully
        match tokio::time::timeout(CLOSE_TIMEOUT, self.stream.close(None)).await {
            Ok(Ok(())) | Ok(Err(tungstenite::Error::ConnectionClosed)) | Err(_) => Ok(()),
            Ok(Err(e)) => Err(map_error(e)),
        }
    }
}

fn map_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::Io(io) => match io.kind() {
            ErrorKind::ConnectionRefused => TransportError::Refused(io.to_string()),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                TransportError::Reset(io.to_string())
            }
            _ => TransportError::Io(io.to_string()),
        },
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ClosedByPeer
        }
        other => TransportError::Io(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_is_reported() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport = WsTransport::new(Duration::from_secs(2));
        let err = transport
            .connect(&format!("ws://127.0.0.1:{port}/ws"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Refused(_)), "got {err:?}");
    }

    #[test]
    fn closed_maps_to_closed_by_peer() {
        assert_eq!(
            map_error(tungstenite::Error::AlreadyClosed),
            TransportError::ClosedByPeer
        );
    }
}
