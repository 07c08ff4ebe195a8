//! Provider trees and the per-communicator provider registry.
//!
//! A provider is a tree of named nodes whose leaves are async callables.
//! The registry resolves incoming listener paths against the root provider
//! and keeps the refcounted slab of callables exported as call arguments.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_wire::ErrorDesc;

use crate::driver::RemoteCallback;

/// Future returned by a provider callable.
pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<Value, ErrorDesc>> + Send>>;

/// A provider leaf: an async function over positional call arguments.
pub type ProviderFn = dyn Fn(CallArgs) -> ProviderFuture + Send + Sync;

pub(crate) fn arc_fn<F, Fut>(f: F) -> Arc<ProviderFn>
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorDesc>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)) as ProviderFuture)
}

/// An object graph of remotely callable methods.
///
/// Leaves are closures, so a method's receiver is whatever the closure
/// captured; resolving `a.b.c` invokes the callable installed under that
/// path with the state it closed over.
///
/// ```
/// use tether_session::Provider;
/// use serde_json::json;
///
/// let provider = Provider::object()
///     .method("plus", |args| async move {
///         let (a, b): (f64, f64) = (args.value(0)?, args.value(1)?);
///         Ok(json!(a + b))
///     })
///     .nested("scientific", Provider::object().method("sqrt", |args| async move {
///         let x: f64 = args.value(0)?;
///         Ok(json!(x.sqrt()))
///     }));
/// # let _ = provider;
/// ```
pub enum Provider {
    Object(HashMap<String, Provider>),
    Function(Arc<ProviderFn>),
}

impl Provider {
    /// An empty object node.
    pub fn object() -> Self {
        Provider::Object(HashMap::new())
    }

    /// A callable leaf.
    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorDesc>> + Send + 'static,
    {
        Provider::Function(arc_fn(f))
    }

    /// Add a callable leaf under `name`.
    pub fn method<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorDesc>> + Send + 'static,
    {
        self.nested(name, Provider::function(f))
    }

    /// Add a child node under `name`.
    ///
    /// # Panics
    ///
    /// Panics when called on a `Function` leaf; entries can only be added
    /// to object nodes.
    pub fn nested(self, name: impl Into<String>, child: Provider) -> Self {
        match self {
            Provider::Object(mut entries) => {
                entries.insert(name.into(), child);
                Provider::Object(entries)
            }
            Provider::Function(_) => panic!("cannot add entries to a function provider"),
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Object(entries) => {
                let mut names: Vec<_> = entries.keys().collect();
                names.sort();
                f.debug_tuple("Object").field(&names).finish()
            }
            Provider::Function(_) => f.write_str("Function"),
        }
    }
}

/// One positional argument of an incoming call.
#[derive(Debug, Clone)]
pub enum CallParam {
    /// A by-value JSON payload.
    Value(Value),
    /// A callable the remote side exported; invoking it calls back across
    /// the same communicator.
    Callback(RemoteCallback),
}

/// Positional argument list handed to a provider callable.
#[derive(Debug, Clone)]
pub struct CallArgs {
    params: Vec<CallParam>,
}

impl CallArgs {
    pub(crate) fn new(params: Vec<CallParam>) -> Self {
        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CallParam> {
        self.params.get(index)
    }

    /// The raw JSON payload at `index`.
    pub fn json(&self, index: usize) -> Result<&Value, ErrorDesc> {
        match self.params.get(index) {
            Some(CallParam::Value(value)) => Ok(value),
            Some(CallParam::Callback(_)) => Err(ErrorDesc::new(
                "TypeError",
                format!("argument {index} is a callback, not a value"),
            )),
            None => Err(ErrorDesc::new(
                "TypeError",
                format!("missing argument {index}"),
            )),
        }
    }

    /// Deserialise the argument at `index`.
    pub fn value<T: DeserializeOwned>(&self, index: usize) -> Result<T, ErrorDesc> {
        let json = self.json(index)?;
        serde_json::from_value(json.clone()).map_err(|e| {
            ErrorDesc::new("TypeError", format!("argument {index} has the wrong type: {e}"))
        })
    }

    /// The callback argument at `index`.
    pub fn callback(&self, index: usize) -> Result<RemoteCallback, ErrorDesc> {
        match self.params.get(index) {
            Some(CallParam::Callback(callback)) => Ok(callback.clone()),
            Some(CallParam::Value(_)) => Err(ErrorDesc::new(
                "TypeError",
                format!("argument {index} is a value, not a callback"),
            )),
            None => Err(ErrorDesc::new(
                "TypeError",
                format!("missing argument {index}"),
            )),
        }
    }

    pub fn into_params(self) -> Vec<CallParam> {
        self.params
    }
}

/// Listener prefix addressing an exported callable by uid instead of a
/// path through the root provider.
pub(crate) const HANDLE_PREFIX: &str = "@handle:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolveError {
    /// The listener path does not lead to a callable.
    NotFound,
    /// The listener targets a handle uid that was released.
    Released(u64),
}

struct HandleEntry {
    callable: Arc<ProviderFn>,
    refs: usize,
}

/// Per-communicator mapping from listener paths and handle uids to
/// callables.
pub(crate) struct ProviderRegistry {
    root: Option<Provider>,
    handles: HashMap<u64, HandleEntry>,
    released: HashSet<u64>,
}

impl ProviderRegistry {
    pub(crate) fn new(root: Option<Provider>) -> Self {
        Self {
            root,
            handles: HashMap::new(),
            released: HashSet::new(),
        }
    }

    pub(crate) fn set_root(&mut self, root: Option<Provider>) {
        self.root = root;
    }

    /// Insert a callable under `uid`, or bump its refcount.
    pub(crate) fn install(&mut self, uid: u64, callable: Arc<ProviderFn>) {
        self.handles
            .entry(uid)
            .and_modify(|entry| entry.refs += 1)
            .or_insert(HandleEntry { callable, refs: 1 });
    }

    /// Drop one reference to `uid`; the entry is evicted (and tombstoned)
    /// when the count reaches zero.
    pub(crate) fn release(&mut self, uid: u64) {
        if let Some(entry) = self.handles.get_mut(&uid) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.handles.remove(&uid);
                self.released.insert(uid);
            }
        }
    }

    /// Resolve a listener path to a callable.
    pub(crate) fn resolve(&self, listener: &str) -> Result<Arc<ProviderFn>, ResolveError> {
        if let Some(rest) = listener.strip_prefix(HANDLE_PREFIX) {
            // Anything after the uid is ignored.
            let digits = rest.split('.').next().unwrap_or(rest);
            let uid: u64 = digits.parse().map_err(|_| ResolveError::NotFound)?;
            if let Some(entry) = self.handles.get(&uid) {
                return Ok(Arc::clone(&entry.callable));
            }
            if self.released.contains(&uid) {
                return Err(ResolveError::Released(uid));
            }
            return Err(ResolveError::NotFound);
        }

        let mut node = self.root.as_ref().ok_or(ResolveError::NotFound)?;
        if !listener.is_empty() {
            for segment in listener.split('.') {
                node = match node {
                    Provider::Object(entries) => {
                        entries.get(segment).ok_or(ResolveError::NotFound)?
                    }
                    Provider::Function(_) => return Err(ResolveError::NotFound),
                };
            }
        }
        match node {
            Provider::Function(callable) => Ok(Arc::clone(callable)),
            Provider::Object(_) => Err(ResolveError::NotFound),
        }
    }

    /// Evict every live handle (communicator teardown).
    pub(crate) fn clear_handles(&mut self) {
        for uid in self.handles.keys() {
            self.released.insert(*uid);
        }
        self.handles.clear();
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.handles.len()
    }
}
