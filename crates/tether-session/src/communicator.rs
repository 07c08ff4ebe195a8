//! The per-endpoint communicator: pending-call table, provider registry,
//! and the send/reply/teardown contract every transport shares.

use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use tether_wire::{ErrorDesc, Frame, Invoke, Parameter, SessionState};

use crate::driver::{Arg, Driver, RemoteCallback};
use crate::errors::CommError;
use crate::pending::{CallOutcome, ExportedHandle, PendingCalls};
use crate::provider::{CallArgs, CallParam, Provider, ProviderRegistry, ResolveError};
use crate::state::{lock, StateCell};
use crate::transport::Outbound;
use crate::UidGenerator;

struct Shared {
    state: Arc<StateCell>,
    registry: Mutex<ProviderRegistry>,
    pending: Mutex<PendingCalls>,
    call_uids: UidGenerator,
    handle_uids: UidGenerator,
    outgoing: mpsc::UnboundedSender<Outbound>,
}

/// One endpoint of an RFC channel.
///
/// A communicator owns everything call-related for its endpoint: the uid
/// counters, the table of in-flight outgoing calls, and the registry the
/// peer's incoming calls resolve against. The transport side is a queue of
/// [`Outbound`] items drained by a [`Pump`](crate::Pump); constructing a
/// communicator yields the receiving end of that queue.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Communicator {
    shared: Arc<Shared>,
}

impl Communicator {
    /// Create a communicator bound to `state`, exposing `provider` to the
    /// peer. The returned receiver must be handed to the transport pump.
    pub fn new(
        state: Arc<StateCell>,
        provider: Option<Provider>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let comm = Self {
            shared: Arc::new(Shared {
                state,
                registry: Mutex::new(ProviderRegistry::new(provider)),
                pending: Mutex::new(PendingCalls::new()),
                call_uids: UidGenerator::new(),
                handle_uids: UidGenerator::new(),
                outgoing,
            }),
        };
        (comm, outgoing_rx)
    }

    /// The proxy driver rooted at the provider root. Idempotent; may be
    /// taken before OPEN (it will not emit until then).
    pub fn get_driver(&self) -> Driver {
        Driver::new(self.clone(), String::new())
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Swap the exposed provider. Only legal before the session is OPEN;
    /// afterwards the provider is read-only.
    pub fn set_provider(&self, provider: Option<Provider>) -> Result<(), CommError> {
        match self.state() {
            SessionState::None | SessionState::Opening => {
                lock(&self.shared.registry).set_root(provider);
                Ok(())
            }
            state => Err(CommError::NotReady { state }),
        }
    }

    /// Number of in-flight outgoing calls.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Number of live exported handles.
    pub fn exported_handles(&self) -> usize {
        lock(&self.shared.registry).live_handles()
    }

    /// Build and emit a call, returning the awaiter for its return.
    ///
    /// The ready gate runs first, so a driver used before OPEN fails
    /// without side effects; the pending entry exists before the frame is
    /// queued towards the wire.
    pub(crate) fn send_call(
        &self,
        listener: &str,
        args: Vec<Arg>,
    ) -> Result<oneshot::Receiver<CallOutcome>, CommError> {
        self.shared.state.require_open()?;

        let mut exported = Vec::new();
        let mut parameters = Vec::with_capacity(args.len());
        {
            let mut registry = lock(&self.shared.registry);
            for arg in args {
                match arg {
                    Arg::Value(value) => parameters.push(Parameter::Value(value)),
                    Arg::Callback { callable, retain } => {
                        let uid = self.shared.handle_uids.next();
                        registry.install(uid, callable);
                        exported.push(ExportedHandle { uid, retain });
                        parameters.push(Parameter::Handle { uid, retain });
                    }
                }
            }
        }

        let uid = self.shared.call_uids.next();
        let rx = match lock(&self.shared.pending).register(uid, exported.clone()) {
            Ok(rx) => rx,
            Err(e) => {
                self.release_handles(&exported);
                return Err(e);
            }
        };

        trace!(uid, listener, "sending call");
        if self
            .shared
            .outgoing
            .send(Outbound::Frame(Frame::Invoke(Invoke::Call {
                uid,
                listener: listener.to_string(),
                parameters,
            })))
            .is_err()
        {
            // Pump is gone; roll the registration back.
            let exported = lock(&self.shared.pending).discard(uid);
            self.release_handles(&exported);
            return Err(CommError::ConnectionClosed);
        }
        Ok(rx)
    }

    /// Feed one decoded invoke from the transport.
    pub(crate) fn reply_data(&self, invoke: Invoke) {
        match invoke {
            Invoke::Call {
                uid,
                listener,
                parameters,
            } => {
                // Provider functions may run concurrently across calls; each
                // dispatch gets its own task and replies through the queue.
                let comm = self.clone();
                tokio::spawn(async move {
                    let value = comm.dispatch_call(uid, &listener, parameters).await;
                    let _ = comm.shared.outgoing.send(Outbound::Frame(Frame::Invoke(value)));
                });
            }
            Invoke::Return {
                uid,
                success,
                value,
            } => self.handle_return(uid, success, value),
        }
    }

    async fn dispatch_call(&self, uid: u64, listener: &str, parameters: Vec<Parameter>) -> Invoke {
        let resolved = lock(&self.shared.registry).resolve(listener);
        let outcome = match resolved {
            Ok(callable) => {
                let args = self.materialise_args(parameters);
                callable(args).await
            }
            Err(ResolveError::NotFound) => {
                debug!(uid, listener, "call to unknown listener");
                Err(ErrorDesc::new(
                    "ListenerNotFound",
                    format!("no invocable listener at {listener:?}"),
                ))
            }
            Err(ResolveError::Released(handle_uid)) => {
                debug!(uid, handle_uid, "call to released handle");
                Err(ErrorDesc::new(
                    "HandleReleased",
                    format!("handle {handle_uid} was already released"),
                ))
            }
        };
        match outcome {
            Ok(value) => Invoke::Return {
                uid,
                success: true,
                value,
            },
            Err(desc) => Invoke::Return {
                uid,
                success: false,
                value: serde_json::to_value(&desc).unwrap_or(Value::Null),
            },
        }
    }

    fn materialise_args(&self, parameters: Vec<Parameter>) -> CallArgs {
        let params = parameters
            .into_iter()
            .map(|parameter| match parameter {
                Parameter::Value(value) => CallParam::Value(value),
                Parameter::Handle { uid, .. } => {
                    CallParam::Callback(RemoteCallback::new(self.clone(), uid))
                }
            })
            .collect();
        CallArgs::new(params)
    }

    fn handle_return(&self, uid: u64, success: bool, value: Value) {
        let outcome = if success {
            Ok(value)
        } else {
            Err(CommError::User(ErrorDesc::from_value(value)))
        };
        let completed = lock(&self.shared.pending).complete(uid, outcome);
        match completed {
            Some(exported) => {
                // Single-use handles are done once the call came back.
                let single_use: Vec<_> =
                    exported.into_iter().filter(|handle| !handle.retain).collect();
                self.release_handles(&single_use);
            }
            None => trace!(uid, "dropping return with no pending entry"),
        }
    }

    fn release_handles(&self, handles: &[ExportedHandle]) {
        if handles.is_empty() {
            return;
        }
        let mut registry = lock(&self.shared.registry);
        for handle in handles {
            registry.release(handle.uid);
        }
    }

    /// Tear the call machinery down: reject every pending caller with
    /// `ConnectionClosed`, refuse new registrations, and evict every
    /// exported handle. Idempotent; replies still in flight are dropped by
    /// the now-empty pending table.
    pub fn shutdown(&self) {
        let failed = lock(&self.shared.pending).fail_all();
        lock(&self.shared.registry).clear_handles();
        if failed > 0 {
            debug!(failed, "rejected pending calls on shutdown");
        }
    }

    /// Queue a raw frame towards the transport (handshake sentinels).
    pub fn post_frame(&self, frame: Frame) -> Result<(), CommError> {
        self.shared
            .outgoing
            .send(Outbound::Frame(frame))
            .map_err(|_| CommError::ConnectionClosed)
    }

    /// Ask the pump to close the transport and exit after draining the
    /// queue.
    pub fn post_shutdown(&self) {
        let _ = self.shared.outgoing.send(Outbound::Shutdown);
    }

    pub(crate) fn mark_closed(&self) {
        self.shared.state.advance_to(SessionState::Closed);
    }

    pub(crate) fn mark_closing(&self) {
        self.shared.state.advance_to(SessionState::Closing);
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
