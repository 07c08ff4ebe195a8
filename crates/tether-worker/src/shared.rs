//! The shared-worker transport: one long-lived worker, many attached
//! clients.
//!
//! The worker binds a Unix domain socket; each connecting client gets its
//! own communicator on the worker side. The handshake mirrors the plain
//! worker transport with the header moved in-band (there is no per-client
//! command line): the client posts OPENING followed by its header
//! envelope, and the worker's acceptance handler answers with OPEN
//! (accept) or CLOSING (reject).

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_session::{
    CommError, Communicator, ConnectError, Provider, Pump, SessionState, StateCell,
};
use tether_stream::JsonLinesFramed;
use tether_wire::{Frame, HeaderEnvelope};

struct ClientSlot {
    comm: Communicator,
    pump: JoinHandle<Result<(), CommError>>,
}

struct ListenerTask {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    path: PathBuf,
}

struct SharedWorkerState {
    lifecycle: StdMutex<Arc<StateCell>>,
    listener: Mutex<Option<ListenerTask>>,
    clients: Arc<Mutex<Vec<ClientSlot>>>,
}

/// The worker side of the shared-worker transport.
///
/// Same lifecycle discipline as the WebSocket server: `open` binds the
/// endpoint, `close` stops accepting and closes every attached client, and
/// a closed worker may be opened again on a fresh lifecycle.
#[derive(Clone)]
pub struct SharedWorkerServer {
    shared: Arc<SharedWorkerState>,
}

impl SharedWorkerServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedWorkerState {
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

    /// Bind the socket at `path` and hand every connecting client to
    /// `handler`.
    pub async fn open<H, Fut>(
        &self,
        path: impl AsRef<Path>,
        handler: H,
    ) -> Result<(), ConnectError>
    where
        H: Fn(SharedWorkerAcceptor) -> Fut + Send + Sync + 'static,
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

        let path = path.as_ref().to_path_buf();
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
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
        *self.shared.listener.lock().await = Some(ListenerTask {
            handle,
            shutdown,
            path,
        });

        cell.advance_to(SessionState::Open);
        debug!("shared worker open");
        Ok(())
    }

    /// Stop accepting and close every attached communicator.
    pub async fn close(&self) -> Result<(), CommError> {
        let cell = self.current_cell();
        cell.begin_close()?;

        if let Some(task) = self.shared.listener.lock().await.take() {
            task.shutdown.notify_one();
            let _ = task.handle.await;
            let _ = std::fs::remove_file(&task.path);
        }

        let mut clients = self.shared.clients.lock().await;
        for slot in clients.drain(..) {
            slot.comm.shutdown();
            let _ = slot.comm.post_frame(Frame::Sentinel(SessionState::Closing));
            slot.comm.post_shutdown();
            let _ = slot.pump.await;
        }
        drop(clients);

        cell.advance_to(SessionState::Closed);
        debug!("shared worker closed");
        Ok(())
    }

    /// Number of clients whose communicators are still running.
    pub async fn client_count(&self) -> usize {
        let mut clients = self.shared.clients.lock().await;
        clients.retain(|slot| !slot.pump.is_finished());
        clients.len()
    }
}

impl Default for SharedWorkerServer {
    fn default() -> Self {
        Self::new()
    }
}

type Handler<Fut> = dyn Fn(SharedWorkerAcceptor) -> Fut + Send + Sync;

async fn accept_loop<Fut>(
    listener: UnixListener,
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
                let (stream, _addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                let clients = Arc::clone(&clients);
                tokio::spawn(async move {
                    match read_handshake(JsonLinesFramed::new(stream)).await {
                        Ok((io, header)) => {
                            handler(SharedWorkerAcceptor {
                                header,
                                io,
                                clients,
                            })
                            .await;
                        }
                        Err(e) => debug!(error = %e, "handshake failed"),
                    }
                });
            }
        }
    }
}

/// Read OPENING followed by the header envelope.
async fn read_handshake(
    mut io: JsonLinesFramed<UnixStream>,
) -> io::Result<(JsonLinesFramed<UnixStream>, Value)> {
    match io.recv().await? {
        Some(Frame::Sentinel(SessionState::Opening)) => {}
        Some(frame) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected OPENING, got {frame:?}"),
            ));
        }
        None => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed during handshake",
            ));
        }
    }
    match io.recv().await? {
        Some(Frame::Header(envelope)) => Ok((io, envelope.header)),
        Some(frame) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected header envelope, got {frame:?}"),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed during handshake",
        )),
    }
}

/// A connecting client awaiting the acceptance handler's verdict.
pub struct SharedWorkerAcceptor {
    header: Value,
    io: JsonLinesFramed<UnixStream>,
    clients: Arc<Mutex<Vec<ClientSlot>>>,
}

impl SharedWorkerAcceptor {
    pub fn header(&self) -> &Value {
        &self.header
    }

    /// Confirm the client with the OPEN sentinel and start its
    /// communicator.
    pub async fn accept(mut self, provider: Option<Provider>) -> Result<Communicator, CommError> {
        self.io.send(&Frame::Sentinel(SessionState::Open)).await?;

        let cell = Arc::new(StateCell::new());
        cell.advance_to(SessionState::Open);
        let (comm, outgoing) = Communicator::new(cell, provider);
        let pump = Pump::new(self.io, comm.clone(), outgoing).spawn();

        let mut clients = self.clients.lock().await;
        clients.retain(|slot| !slot.pump.is_finished());
        clients.push(ClientSlot {
            comm: comm.clone(),
            pump,
        });
        Ok(comm)
    }

    /// Refuse the client: answer CLOSING and drop the connection.
    pub async fn reject(mut self) -> Result<(), CommError> {
        debug!("rejecting client");
        self.io.send(&Frame::Sentinel(SessionState::Closing)).await?;
        let mut stream = self.io.into_inner();
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
        Ok(())
    }
}

struct ActiveAttachment {
    comm: Communicator,
    pump: JoinHandle<Result<(), CommError>>,
}

/// The client side of the shared-worker transport: attaches to a running
/// worker's socket.
pub struct SharedWorkerConnector {
    lifecycle: Arc<StateCell>,
    active: Mutex<Option<ActiveAttachment>>,
}

impl SharedWorkerConnector {
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(StateCell::new()),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    /// Attach to the worker at `path`, sending `header` for the acceptance
    /// decision.
    pub async fn connect(
        &self,
        path: impl AsRef<Path>,
        header: Value,
        provider: Option<Provider>,
    ) -> Result<Communicator, ConnectError> {
        self.lifecycle.begin_open()?;
        match self.dial(path.as_ref(), header, provider).await {
            Ok(comm) => {
                self.lifecycle.advance_to(SessionState::Open);
                debug!("shared worker channel open");
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
        path: &Path,
        header: Value,
        provider: Option<Provider>,
    ) -> Result<Communicator, ConnectError> {
        let stream = UnixStream::connect(path).await?;
        let mut io = JsonLinesFramed::new(stream);

        io.send(&Frame::Sentinel(SessionState::Opening)).await?;
        io.send(&Frame::Header(HeaderEnvelope { header })).await?;
        match io.recv().await? {
            Some(Frame::Sentinel(SessionState::Open)) => {}
            Some(Frame::Sentinel(SessionState::Closing)) => {
                return Err(ConnectError::Rejected {
                    code: None,
                    reason: "refused by worker".into(),
                });
            }
            Some(frame) => {
                return Err(CommError::Protocol {
                    context: format!("expected OPEN from worker, got {frame:?}"),
                }
                .into());
            }
            None => {
                return Err(ConnectError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "worker closed during handshake",
                )));
            }
        }

        let (comm, outgoing) = Communicator::new(self.lifecycle.clone(), provider);
        let pump = Pump::new(io, comm.clone(), outgoing).spawn();
        *self.active.lock().await = Some(ActiveAttachment {
            comm: comm.clone(),
            pump,
        });
        Ok(comm)
    }

    /// Detach from the worker.
    pub async fn close(&self) -> Result<(), CommError> {
        self.lifecycle.begin_close()?;
        if let Some(attachment) = self.active.lock().await.take() {
            attachment.comm.shutdown();
            let _ = attachment
                .comm
                .post_frame(Frame::Sentinel(SessionState::Closing));
            attachment.comm.post_shutdown();
            let _ = attachment.pump.await;
        }
        self.lifecycle.advance_to(SessionState::Closed);
        Ok(())
    }
}

impl Default for SharedWorkerConnector {
    fn default() -> Self {
        Self::new()
    }
}
