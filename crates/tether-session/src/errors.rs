//! Error taxonomy for the communicator core.

use std::io;

use tether_wire::{CodecError, ErrorDesc, SessionState};

/// Error raised by communicator operations.
///
/// Kinds that can be localised to a single call (`ListenerNotFound`,
/// `HandleReleased`, `User`) travel the wire as failed returns; kinds that
/// compromise the channel (`Protocol`, `Transport`) tear the communicator
/// down and fan `ConnectionClosed` out to every pending caller.
#[derive(Debug)]
pub enum CommError {
    /// The operation requires OPEN but the session is in another state.
    NotReady { state: SessionState },
    /// `open`/`connect` was called outside NONE.
    AlreadyOpen { state: SessionState },
    /// A pending call was rejected because the channel closed.
    ConnectionClosed,
    /// Frame decode failure or an unexpected frame shape. Fatal.
    Protocol { context: String },
    /// An incoming call's listener path did not resolve.
    ListenerNotFound { listener: String },
    /// An incoming call targeted a handle uid that was already released.
    HandleReleased { uid: u64 },
    /// The remote provider raised; name, message, and stack are preserved.
    User(ErrorDesc),
    /// A local value failed to (de)serialise.
    Codec(serde_json::Error),
    /// Underlying socket/process failure. Fatal.
    Transport(io::Error),
}

impl CommError {
    pub(crate) fn protocol(context: impl Into<String>) -> Self {
        CommError::Protocol {
            context: context.into(),
        }
    }
}

impl std::fmt::Display for CommError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommError::NotReady { state } => {
                write!(f, "channel is not ready (state: {state})")
            }
            CommError::AlreadyOpen { state } => {
                write!(f, "channel was already opened (state: {state})")
            }
            CommError::ConnectionClosed => write!(f, "connection closed"),
            CommError::Protocol { context } => write!(f, "protocol error: {context}"),
            CommError::ListenerNotFound { listener } => {
                write!(f, "listener not found: {listener:?}")
            }
            CommError::HandleReleased { uid } => {
                write!(f, "handle {uid} was already released")
            }
            CommError::User(desc) => write!(f, "remote error: {desc}"),
            CommError::Codec(e) => write!(f, "codec error: {e}"),
            CommError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for CommError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommError::Codec(e) => Some(e),
            CommError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CommError {
    fn from(e: io::Error) -> Self {
        CommError::Transport(e)
    }
}

impl From<CodecError> for CommError {
    fn from(e: CodecError) -> Self {
        CommError::protocol(e.to_string())
    }
}

/// Error establishing a transport connection.
///
/// Shared by every connector; transport crates add nothing on top.
#[derive(Debug)]
pub enum ConnectError {
    /// Session-level failure (wrong lifecycle state, protocol violation).
    Comm(CommError),
    /// Dial or spawn failure.
    Io(io::Error),
    /// The remote acceptance handler refused the connection.
    Rejected { code: Option<u16>, reason: String },
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Comm(e) => write!(f, "{e}"),
            ConnectError::Io(e) => write!(f, "connect failed: {e}"),
            ConnectError::Rejected { code, reason } => match code {
                Some(code) => write!(f, "connection rejected ({code}): {reason}"),
                None => write!(f, "connection rejected: {reason}"),
            },
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Comm(e) => Some(e),
            ConnectError::Io(e) => Some(e),
            ConnectError::Rejected { .. } => None,
        }
    }
}

impl From<CommError> for ConnectError {
    fn from(e: CommError) -> Self {
        ConnectError::Comm(e)
    }
}

impl From<io::Error> for ConnectError {
    fn from(e: io::Error) -> Self {
        ConnectError::Io(e)
    }
}
