//! The child side of the worker transport.
//!
//! A worker process opens its channel over its own stdio: it posts the
//! OPENING sentinel, waits for the parent's OPEN, and is then live. The
//! handshake header arrives out of band, as the trailing `__m_pArgs=<json>`
//! command-line argument the parent appended at spawn time.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use tether_session::{
    CommError, Communicator, ConnectError, Driver, Provider, Pump, SessionState, StateCell,
};
use tether_stream::JsonLinesFramed;
use tether_wire::Frame;

use crate::parent::HEADER_ARG_PREFIX;

/// Extract the header from an argument list (`__m_pArgs=<json>`).
pub fn parse_header_arg<I>(args: I) -> Option<Value>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .find_map(|arg| arg.strip_prefix(HEADER_ARG_PREFIX).map(str::to_string))
        .and_then(|json| serde_json::from_str(&json).ok())
}

/// The header this process was spawned with, if any.
pub fn header_from_args() -> Option<Value> {
    parse_header_arg(std::env::args().skip(1))
}

/// A worker's communication channel back to the process that spawned it.
pub struct WorkerChannel {
    lifecycle: Arc<StateCell>,
    comm: Communicator,
    pump: Mutex<Option<JoinHandle<Result<(), CommError>>>>,
    header: Option<Value>,
}

impl WorkerChannel {
    /// Open the channel over this process's stdio, exposing `provider` to
    /// the parent. The header is read from the command line.
    pub async fn open(provider: Option<Provider>) -> Result<Self, ConnectError> {
        let io = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
        Self::attach(io, header_from_args(), provider).await
    }

    /// Open the channel over an arbitrary duplex stream (the parent side
    /// must run the matching handshake).
    pub async fn attach<S>(
        stream: S,
        header: Option<Value>,
        provider: Option<Provider>,
    ) -> Result<Self, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let lifecycle = Arc::new(StateCell::new());
        lifecycle.begin_open()?;

        let mut io = JsonLinesFramed::new(stream);
        let handshake = async {
            io.send(&Frame::Sentinel(SessionState::Opening)).await?;
            match io.recv().await? {
                Some(Frame::Sentinel(SessionState::Open)) => Ok(()),
                Some(frame) => Err(ConnectError::Comm(CommError::Protocol {
                    context: format!("expected OPEN from parent, got {frame:?}"),
                })),
                None => Err(ConnectError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "parent closed before handshake",
                ))),
            }
        };
        if let Err(e) = handshake.await {
            lifecycle.advance_to(SessionState::Closed);
            return Err(e);
        }

        let (comm, outgoing) = Communicator::new(lifecycle.clone(), provider);
        let pump = Pump::new(io, comm.clone(), outgoing).spawn();
        lifecycle.advance_to(SessionState::Open);
        debug!("worker channel open");

        Ok(Self {
            lifecycle,
            comm,
            pump: Mutex::new(Some(pump)),
            header,
        })
    }

    /// The header the parent spawned this worker with.
    pub fn header(&self) -> Option<&Value> {
        self.header.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    /// Driver onto the parent's provider.
    pub fn get_driver(&self) -> Driver {
        self.comm.get_driver()
    }

    /// Block until the channel dies, whether by our close, the parent's
    /// CLOSING sentinel, or a transport failure. A worker main typically
    /// ends with this.
    pub async fn wait(&self) -> Result<(), CommError> {
        let pump = self.pump.lock().await.take();
        match pump {
            Some(pump) => match pump.await {
                Ok(result) => result,
                Err(_) => Err(CommError::ConnectionClosed),
            },
            // Someone already waited; the channel is done.
            None => Ok(()),
        }
    }

    /// Close the channel from the worker side.
    pub async fn close(&self) -> Result<(), CommError> {
        self.lifecycle.begin_close()?;
        self.comm.shutdown();
        let _ = self.comm.post_frame(Frame::Sentinel(SessionState::Closing));
        self.comm.post_shutdown();
        let _ = self.wait().await;
        self.lifecycle.advance_to(SessionState::Closed);
        Ok(())
    }
}
