//! The multi-client WebSocket server.
//!
//! The server owns a listener lifecycle and one communicator per accepted
//! client. Each upgrade reads the client's header envelope and hands a
//! pending [`WsAcceptor`] to the user's acceptance handler, which decides
//! between `accept(provider)` and `reject(code, reason)`. Business frames
//! only start flowing once the acceptor was accepted.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, warn};

use tether_session::{
    CommError, Communicator, ConnectError, Provider, Pump, SessionState, StateCell,
};
use tether_wire::{decode_frame, encode_frame, Frame};

use crate::transport::{ws_io_error, WsTransport};

struct ClientSlot {
    comm: Communicator,
    pump: JoinHandle<Result<(), CommError>>,
}

struct ListenerTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

struct ServerShared {
    lifecycle: StdMutex<Arc<StateCell>>,
    listener: Mutex<Option<ListenerTask>>,
    clients: Arc<Mutex<Vec<ClientSlot>>>,
}

/// A WebSocket server accepting many concurrent clients.
///
/// `open` binds the port and enters OPEN; `close` stops accepting, closes
/// every live communicator (failing its pending calls over), and lands in
/// CLOSED. A closed server may be opened again: that constructs a fresh
/// listener and a fresh lifecycle.
#[derive(Clone)]
pub struct WsServer {
    shared: Arc<ServerShared>,
}

impl WsServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServerShared {
                lifecycle: StdMutex::new(Arc::new(StateCell::new())),
                listener: Mutex::new(None),
                clients: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.current_cell().get()
    }

    fn current_cell(&self) -> Arc<StateCell> {
        self.shared
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Bind `port` and start accepting upgrades, handing each pending
    /// client to `handler`. Returns the bound address (useful with port 0).
    pub async fn open<H, Fut>(&self, port: u16, handler: H) -> Result<SocketAddr, ConnectError>
    where
        H: Fn(WsAcceptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cell = {
            let mut guard = self
                .shared
                .lifecycle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.get() == SessionState::Closed {
                *guard = Arc::new(StateCell::new());
            }
            guard.clone()
        };
        cell.begin_open()?;

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                cell.advance_to(SessionState::Closed);
                return Err(ConnectError::Io(e));
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                cell.advance_to(SessionState::Closed);
                return Err(ConnectError::Io(e));
            }
        };

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::new(handler),
            Arc::clone(&self.shared.clients),
            Arc::clone(&shutdown),
        ));
        *self.shared.listener.lock().await = Some(ListenerTask { handle, shutdown });

        cell.advance_to(SessionState::Open);
        debug!(%addr, "websocket server open");
        Ok(addr)
    }

    /// Stop the listener and close every live client communicator; each
    /// one's pending calls are rejected with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), CommError> {
        let cell = self.current_cell();
        cell.begin_close()?;

        if let Some(task) = self.shared.listener.lock().await.take() {
            task.shutdown.notify_one();
            let _ = task.handle.await;
        }

        let mut clients = self.shared.clients.lock().await;
        for slot in clients.drain(..) {
            slot.comm.shutdown();
            slot.comm.post_shutdown();
            let _ = slot.pump.await;
        }
        drop(clients);

        cell.advance_to(SessionState::Closed);
        debug!("websocket server closed");
        Ok(())
    }

    /// Number of clients whose communicators are still running.
    pub async fn client_count(&self) -> usize {
        let mut clients = self.shared.clients.lock().await;
        clients.retain(|slot| !slot.pump.is_finished());
        clients.len()
    }
}

impl Default for WsServer {
    fn default() -> Self {
        Self::new()
    }
}

type Handler<Fut> = dyn Fn(WsAcceptor) -> Fut + Send + Sync;

async fn accept_loop<Fut>(
    listener: TcpListener,
    handler: Arc<Handler<Fut>>,
    clients: Arc<Mutex<Vec<ClientSlot>>>,
    shutdown: Arc<Notify>,
) where
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.notified() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, "incoming upgrade");
                let handler = Arc::clone(&handler);
                let clients = Arc::clone(&clients);
                tokio::spawn(async move {
                    match read_handshake(stream).await {
                        Ok((ws, header)) => {
                            handler(WsAcceptor {
                                header,
                                ws,
                                clients,
                            })
                            .await;
                        }
                        Err(e) => debug!(%peer, error = %e, "handshake failed"),
                    }
                });
            }
        }
    }
}

/// Upgrade the socket and read the client's header envelope.
async fn read_handshake(
    stream: TcpStream,
) -> io::Result<(WebSocketStream<TcpStream>, Value)> {
    let mut ws = accept_async(stream).await.map_err(ws_io_error)?;
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let frame = decode_frame(text.as_ref())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                return match frame {
                    Frame::Header(envelope) => Ok((ws, envelope.header)),
                    frame => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("expected header envelope, got {frame:?}"),
                    )),
                };
            }
            Some(Ok(WsMessage::Ping(data))) => {
                let _ = ws.send(WsMessage::Pong(data)).await;
            }
            Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
            Some(Ok(other)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected header envelope, got {other:?}"),
                ));
            }
            Some(Err(e)) => return Err(ws_io_error(e)),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                ));
            }
        }
    }
}

/// A client whose upgrade and header arrived but whose fate is still in
/// the acceptance handler's hands. No business frames are processed until
/// `accept` starts the communicator's pump.
pub struct WsAcceptor {
    header: Value,
    ws: WebSocketStream<TcpStream>,
    clients: Arc<Mutex<Vec<ClientSlot>>>,
}

impl WsAcceptor {
    /// The header the client sent at handshake time.
    pub fn header(&self) -> &Value {
        &self.header
    }

    /// Confirm the connection, expose `provider` to the client, and start
    /// the communicator.
    pub async fn accept(mut self, provider: Option<Provider>) -> Result<Communicator, CommError> {
        self.ws
            .send(WsMessage::Text(encode_frame(&Frame::Confirm).into()))
            .await
            .map_err(|e| CommError::Transport(ws_io_error(e)))?;

        let cell = Arc::new(StateCell::new());
        cell.advance_to(SessionState::Open);
        let (comm, outgoing) = Communicator::new(cell, provider);
        let pump = Pump::new(WsTransport::new(self.ws), comm.clone(), outgoing).spawn();

        let mut clients = self.clients.lock().await;
        clients.retain(|slot| !slot.pump.is_finished());
        clients.push(ClientSlot {
            comm: comm.clone(),
            pump,
        });
        Ok(comm)
    }

    /// Refuse the connection, closing the socket with `code` and `reason`.
    pub async fn reject(mut self, code: u16, reason: &str) -> Result<(), CommError> {
        debug!(code, reason, "rejecting client");
        self.ws
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            }))
            .await
            .map_err(|e| CommError::Transport(ws_io_error(e)))?;
        Ok(())
    }
}
