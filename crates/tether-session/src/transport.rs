//! Frame transport abstraction and the per-communicator IO pump.

use std::future::Future;
use std::io;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use tether_wire::{Frame, SessionState};

use crate::communicator::Communicator;
use crate::errors::CommError;

/// An in-order, reliable, message-boundary-preserving duplex channel of
/// frames.
///
/// Implementations: the WebSocket adapter (text frames carry the JSON
/// codec directly) and the line-delimited stream framing used by the
/// worker transports. Decode failures must surface as
/// `io::ErrorKind::InvalidData` so the pump can distinguish protocol
/// errors from transport failures.
pub trait FrameTransport: Send {
    /// Send one frame.
    fn post(&mut self, frame: &Frame) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next frame; `Ok(None)` means the peer closed cleanly.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Frame>>> + Send;

    /// Close the transport locally.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// An item on a communicator's outgoing queue.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Close the transport and stop the pump once the queue is drained up
    /// to this point.
    Shutdown,
}

/// The IO loop owning one communicator's transport.
///
/// All wire traffic for a communicator flows through its pump task, which
/// serialises sends and feeds received invokes back into the communicator.
/// The pump runs from the moment the handshake completed until the channel
/// dies: local close (a `Shutdown` queue item), peer close (CLOSING
/// sentinel or transport EOF), or failure.
pub struct Pump<T> {
    io: T,
    comm: Communicator,
    outgoing: mpsc::UnboundedReceiver<Outbound>,
}

impl<T> Pump<T>
where
    T: FrameTransport + 'static,
{
    pub fn new(io: T, comm: Communicator, outgoing: mpsc::UnboundedReceiver<Outbound>) -> Self {
        Self { io, comm, outgoing }
    }

    /// Spawn the pump onto the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<(), CommError>> {
        tokio::spawn(self.run())
    }

    /// Run until the channel closes. Transport and protocol failures tear
    /// the communicator down (pending calls get `ConnectionClosed`) before
    /// the error is returned.
    pub async fn run(mut self) -> Result<(), CommError> {
        loop {
            tokio::select! {
                outbound = self.outgoing.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = self.io.post(&frame).await {
                            return self.fail(e).await;
                        }
                    }
                    // A dropped queue means every communicator clone is gone;
                    // treat it like a requested shutdown.
                    Some(Outbound::Shutdown) | None => {
                        let _ = self.io.close().await;
                        self.comm.mark_closed();
                        return Ok(());
                    }
                },
                received = self.io.recv() => match received {
                    Ok(Some(Frame::Invoke(invoke))) => self.comm.reply_data(invoke),
                    Ok(Some(Frame::Sentinel(SessionState::Closing))) => {
                        // Peer-initiated close.
                        debug!("peer requested close");
                        self.comm.mark_closing();
                        self.comm.shutdown();
                        let _ = self.io.close().await;
                        self.comm.mark_closed();
                        return Ok(());
                    }
                    Ok(Some(frame)) => {
                        warn!(?frame, "unexpected frame outside handshake");
                        self.comm.mark_closing();
                        self.comm.shutdown();
                        let _ = self.io.close().await;
                        self.comm.mark_closed();
                        return Err(CommError::protocol(format!(
                            "unexpected frame outside handshake: {frame:?}"
                        )));
                    }
                    Ok(None) => {
                        // Transport ended. If we asked for the close this is
                        // the expected tail; otherwise the peer vanished and
                        // pending callers are failed over.
                        self.comm.mark_closing();
                        self.comm.shutdown();
                        self.comm.mark_closed();
                        return Ok(());
                    }
                    Err(e) => return self.fail(e).await,
                },
            }
        }
    }

    async fn fail(&mut self, e: io::Error) -> Result<(), CommError> {
        warn!(error = %e, "transport failure");
        self.comm.mark_closing();
        self.comm.shutdown();
        let _ = self.io.close().await;
        self.comm.mark_closed();
        if e.kind() == io::ErrorKind::InvalidData {
            Err(CommError::protocol(e.to_string()))
        } else {
            Err(CommError::Transport(e))
        }
    }
}
