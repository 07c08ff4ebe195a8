//! The dialing side of the WebSocket transport.

use std::io;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use tether_session::{
    CommError, Communicator, ConnectError, Provider, Pump, SessionState, StateCell,
};
use tether_wire::{decode_frame, encode_frame, Frame, HeaderEnvelope};

use crate::transport::{ws_io_error, WsTransport};

type ClientStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct ActiveLink {
    comm: Communicator,
    pump: JoinHandle<Result<(), CommError>>,
}

/// Dials one WebSocket server and runs one communicator over the
/// connection.
///
/// A connector is a single lifecycle: NONE → `connect` → OPEN → `close` →
/// CLOSED. `connect` outside NONE is an `AlreadyOpen` error and `close`
/// outside OPEN is `NotReady`; reconnecting means constructing a new
/// connector.
pub struct WsConnector {
    lifecycle: Arc<StateCell>,
    active: Mutex<Option<ActiveLink>>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(StateCell::new()),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    /// Dial `url`, send the handshake header, and wait for the server's
    /// acceptance. On success the channel is OPEN and the returned
    /// communicator's driver is live. A failure during the handshake lands
    /// the connector in CLOSED.
    pub async fn connect(
        &self,
        url: &str,
        header: Value,
        provider: Option<Provider>,
    ) -> Result<Communicator, ConnectError> {
        self.lifecycle.begin_open()?;
        match self.dial(url, header, provider).await {
            Ok(link) => {
                let comm = link.comm.clone();
                *self.active.lock().await = Some(link);
                self.lifecycle.advance_to(SessionState::Open);
                debug!(url, "websocket channel open");
                Ok(comm)
            }
            Err(e) => {
                self.lifecycle.advance_to(SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn dial(
        &self,
        url: &str,
        header: Value,
        provider: Option<Provider>,
    ) -> Result<ActiveLink, ConnectError> {
        let (mut ws, _response) = connect_async(url)
            .await
            .map_err(|e| ConnectError::Io(io::Error::other(e.to_string())))?;

        ws.send(WsMessage::Text(
            encode_frame(&Frame::Header(HeaderEnvelope { header })).into(),
        ))
        .await
        .map_err(|e| ConnectError::Io(ws_io_error(e)))?;

        wait_for_confirmation(&mut ws).await?;

        let (comm, outgoing) = Communicator::new(self.lifecycle.clone(), provider);
        let pump = Pump::new(WsTransport::new(ws), comm.clone(), outgoing).spawn();
        Ok(ActiveLink { comm, pump })
    }

    /// Close the channel: every pending call is rejected with
    /// `ConnectionClosed` and the socket is shut down.
    pub async fn close(&self) -> Result<(), CommError> {
        self.lifecycle.begin_close()?;
        if let Some(link) = self.active.lock().await.take() {
            link.comm.shutdown();
            link.comm.post_shutdown();
            let _ = link.pump.await;
        }
        self.lifecycle.advance_to(SessionState::Closed);
        debug!("websocket channel closed");
        Ok(())
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_confirmation(ws: &mut ClientStream) -> Result<(), ConnectError> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return match decode_frame(text.as_ref()).map_err(CommError::from)? {
                    Frame::Confirm => Ok(()),
                    frame => Err(CommError::Protocol {
                        context: format!("unexpected frame during handshake: {frame:?}"),
                    }
                    .into()),
                };
            }
            Some(Ok(WsMessage::Ping(data))) => {
                let _ = ws.send(WsMessage::Pong(data)).await;
            }
            Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
            Some(Ok(WsMessage::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                };
                return Err(ConnectError::Rejected { code, reason });
            }
            Some(Ok(WsMessage::Binary(_))) => {
                return Err(CommError::Protocol {
                    context: "binary frame during handshake".into(),
                }
                .into());
            }
            Some(Err(e)) => return Err(ConnectError::Io(ws_io_error(e))),
            None => {
                return Err(ConnectError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before acceptance",
                )));
            }
        }
    }
}
