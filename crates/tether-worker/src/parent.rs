//! The parent side of the worker transport.
//!
//! The parent spawns a child worker process, passes the handshake header
//! through the child's command line, and talks line-framed JSON over the
//! child's stdio. The in-band handshake is two sentinels: the child posts
//! OPENING, the parent answers OPEN.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_session::{
    CommError, Communicator, ConnectError, Provider, Pump, SessionState, StateCell,
};
use tether_stream::JsonLinesFramed;
use tether_wire::Frame;

/// Command-line key carrying the serialised header to the child.
pub const HEADER_ARG_PREFIX: &str = "__m_pArgs=";

/// How long a closed worker gets to exit on its own before it is killed.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

struct ActiveWorker {
    comm: Communicator,
    pump: JoinHandle<Result<(), CommError>>,
    child: Option<Child>,
}

/// Spawns one child worker process and runs one communicator over its
/// stdio.
///
/// Like every connector, this is a single lifecycle: NONE → `connect` →
/// OPEN → `close` → CLOSED.
pub struct WorkerConnector {
    lifecycle: Arc<StateCell>,
    active: Mutex<Option<ActiveWorker>>,
}

impl WorkerConnector {
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(StateCell::new()),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    /// Spawn `program args…` with the header appended as the trailing
    /// `__m_pArgs=<json>` argument, then handshake over its stdio.
    pub async fn connect(
        &self,
        program: &str,
        args: &[String],
        header: Value,
        provider: Option<Provider>,
    ) -> Result<Communicator, ConnectError> {
        self.lifecycle.begin_open()?;
        match self.launch(program, args, header, provider).await {
            Ok(comm) => {
                self.lifecycle.advance_to(SessionState::Open);
                debug!(program, "worker channel open");
                Ok(comm)
            }
            Err(e) => {
                self.lifecycle.advance_to(SessionState::Closed);
                Err(e)
            }
        }
    }

    /// Run the parent side over an already-established duplex stream
    /// instead of spawning a process. The peer must drive the child side of
    /// the handshake.
    pub async fn attach<S>(
        &self,
        stream: S,
        provider: Option<Provider>,
    ) -> Result<Communicator, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.lifecycle.begin_open()?;
        match self
            .establish(JsonLinesFramed::new(stream), None, provider)
            .await
        {
            Ok(comm) => {
                self.lifecycle.advance_to(SessionState::Open);
                Ok(comm)
            }
            Err(e) => {
                self.lifecycle.advance_to(SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        program: &str,
        args: &[String],
        header: Value,
        provider: Option<Provider>,
    ) -> Result<Communicator, ConnectError> {
        let mut child = Command::new(program)
            .args(args)
            .arg(format!("{HEADER_ARG_PREFIX}{header}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not captured"))?;
        let io = JsonLinesFramed::new(tokio::io::join(stdout, stdin));
        self.establish(io, Some(child), provider).await
    }

    async fn establish<S>(
        &self,
        mut io: JsonLinesFramed<S>,
        child: Option<Child>,
        provider: Option<Provider>,
    ) -> Result<Communicator, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match io.recv().await? {
            Some(Frame::Sentinel(SessionState::Opening)) => {}
            Some(frame) => {
                return Err(CommError::Protocol {
                    context: format!("expected OPENING from worker, got {frame:?}"),
                }
                .into());
            }
            None => {
                return Err(ConnectError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "worker exited before handshake",
                )));
            }
        }
        io.send(&Frame::Sentinel(SessionState::Open)).await?;

        let (comm, outgoing) = Communicator::new(self.lifecycle.clone(), provider);
        let pump = Pump::new(io, comm.clone(), outgoing).spawn();
        *self.active.lock().await = Some(ActiveWorker {
            comm: comm.clone(),
            pump,
            child,
        });
        Ok(comm)
    }

    /// Close the channel: signal CLOSING to the worker, reject pending
    /// calls with `ConnectionClosed`, and reap the child process.
    pub async fn close(&self) -> Result<(), CommError> {
        self.lifecycle.begin_close()?;
        if let Some(mut worker) = self.active.lock().await.take() {
            worker.comm.shutdown();
            let _ = worker.comm.post_frame(Frame::Sentinel(SessionState::Closing));
            worker.comm.post_shutdown();
            let _ = worker.pump.await;

            if let Some(mut child) = worker.child.take() {
                match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
                    Ok(Ok(status)) => debug!(%status, "worker exited"),
                    Ok(Err(e)) => warn!(error = %e, "failed to reap worker"),
                    Err(_) => {
                        warn!("worker did not exit, killing it");
                        let _ = child.kill().await;
                    }
                }
            }
        }
        self.lifecycle.advance_to(SessionState::Closed);
        Ok(())
    }
}

impl Default for WorkerConnector {
    fn default() -> Self {
        Self::new()
    }
}
