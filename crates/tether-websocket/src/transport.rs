//! WebSocket frame transport: tether frames as text messages.

use std::io;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use tether_session::FrameTransport;
use tether_wire::{decode_frame, encode_frame, Frame};

pub(crate) fn ws_io_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::other(e.to_string())
}

/// WebSocket transport for tether frames.
///
/// The codec is JSON text, so every frame travels as one text message;
/// binary messages are protocol violations.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl<S> FrameTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn post(&mut self, frame: &Frame) -> io::Result<()> {
        self.stream
            .send(WsMessage::Text(encode_frame(frame).into()))
            .await
            .map_err(ws_io_error)
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = decode_frame(text.as_ref()).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    return Ok(Some(frame));
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "binary frames not allowed",
                    ));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = self.stream.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) => return Ok(None),
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(ws_io_error(e)),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        // A close error usually means the peer already went away.
        let _ = self.stream.close(None).await;
        Ok(())
    }
}
