//! The caller-side proxy driver.
//!
//! A [`Driver`] records a dot-path through the remote provider and, on
//! invocation, synthesises a call frame from the path and the argument
//! list. No declaration of the remote interface is needed: `get` chains to
//! arbitrary depth and `invoke` fires at the current path.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tether_wire::ErrorDesc;

use crate::communicator::Communicator;
use crate::errors::CommError;
use crate::provider::{arc_fn, CallArgs, ProviderFn, HANDLE_PREFIX};

/// A chainable handle onto the remote provider.
///
/// Cloning is cheap; clones share the communicator. A driver is inert until
/// the communicator reaches OPEN: earlier invocations fail with `NotReady`
/// without touching the wire.
///
/// ```ignore
/// let driver = communicator.get_driver();
/// let five = driver.call("plus", vec![json!(2).into(), json!(3).into()]).await?;
/// let four = driver.get("scientific").call("sqrt", vec![json!(16).into()]).await?;
/// ```
#[derive(Clone)]
pub struct Driver {
    comm: Communicator,
    path: String,
}

impl Driver {
    pub(crate) fn new(comm: Communicator, path: String) -> Self {
        Self { comm, path }
    }

    /// The dot-path this driver points at (empty for the provider root).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Extend the path by one or more segments (`segment` may itself be
    /// dotted).
    pub fn get(&self, segment: &str) -> Driver {
        let path = if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{segment}", self.path)
        };
        Driver::new(self.comm.clone(), path)
    }

    /// Invoke the callable at the current path.
    pub async fn invoke(&self, args: Vec<Arg>) -> Result<Value, CommError> {
        let rx = self.comm.send_call(&self.path, args)?;
        match rx.await {
            Ok(outcome) => outcome,
            // The pump vanished between registration and delivery.
            Err(_) => Err(CommError::ConnectionClosed),
        }
    }

    /// Invoke the callable at `path` relative to this driver.
    pub async fn call(&self, path: &str, args: Vec<Arg>) -> Result<Value, CommError> {
        self.get(path).invoke(args).await
    }

    /// [`Driver::invoke`], deserialising the result.
    pub async fn invoke_as<T: DeserializeOwned>(&self, args: Vec<Arg>) -> Result<T, CommError> {
        let value = self.invoke(args).await?;
        serde_json::from_value(value).map_err(CommError::Codec)
    }

    /// [`Driver::call`], deserialising the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        path: &str,
        args: Vec<Arg>,
    ) -> Result<T, CommError> {
        self.get(path).invoke_as(args).await
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("path", &self.path).finish()
    }
}

/// One outgoing call argument.
///
/// Values travel by copy; callbacks are exported into the local provider
/// registry under a fresh handle uid and travel by reference. A plain
/// callback is single-use: its uid is released when the call returns. A
/// retained callback survives the return (for callbacks the remote side
/// stores and fires later) and is only evicted when the communicator
/// closes.
pub enum Arg {
    Value(Value),
    Callback {
        callable: Arc<ProviderFn>,
        retain: bool,
    },
}

impl Arg {
    /// A by-value argument from anything serialisable.
    pub fn value<T: Serialize>(value: &T) -> Result<Arg, CommError> {
        Ok(Arg::Value(
            serde_json::to_value(value).map_err(CommError::Codec)?,
        ))
    }

    /// A single-use callback argument.
    pub fn callback<F, Fut>(f: F) -> Arg
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorDesc>> + Send + 'static,
    {
        Arg::Callback {
            callable: arc_fn(f),
            retain: false,
        }
    }

    /// A callback the remote side may store and fire after the call
    /// returned.
    pub fn retained<F, Fut>(f: F) -> Arg
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorDesc>> + Send + 'static,
    {
        Arg::Callback {
            callable: arc_fn(f),
            retain: true,
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl std::fmt::Debug for Arg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arg::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Arg::Callback { retain, .. } => {
                f.debug_struct("Callback").field("retain", retain).finish()
            }
        }
    }
}

/// A callable the remote side passed as a by-reference parameter.
///
/// Invoking it emits a call targeting `@handle:<uid>` back over the same
/// communicator. Once the exporter releases the uid, invocations fail with
/// a `HandleReleased` remote error.
#[derive(Debug, Clone)]
pub struct RemoteCallback {
    driver: Driver,
    uid: u64,
}

impl RemoteCallback {
    pub(crate) fn new(comm: Communicator, uid: u64) -> Self {
        Self {
            driver: Driver::new(comm, format!("{HANDLE_PREFIX}{uid}")),
            uid,
        }
    }

    /// The exporter-side handle uid.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub async fn invoke(&self, args: Vec<Arg>) -> Result<Value, CommError> {
        self.driver.invoke(args).await
    }

    pub async fn invoke_as<T: DeserializeOwned>(&self, args: Vec<Arg>) -> Result<T, CommError> {
        self.driver.invoke_as(args).await
    }
}
