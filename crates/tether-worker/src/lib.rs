#![deny(unsafe_code)]

//! Worker transports for the tether RFC runtime.
//!
//! Two shapes share the line-framed JSON channel from `tether-stream`:
//!
//! - **Worker**: a parent process spawns one child worker and talks to it
//!   over the child's stdio ([`WorkerConnector`] / [`WorkerChannel`]). The
//!   header travels in the child's command line as `__m_pArgs=<json>`.
//! - **Shared worker** (Unix): one long-lived worker serves many clients
//!   over a Unix domain socket ([`SharedWorkerServer`] /
//!   [`SharedWorkerConnector`]), one communicator per attached client.
//!
//! Lifecycle signalling is in-band: the five state sentinels, which the
//! codec keeps disjoint from invoke frames.

mod child;
mod parent;
#[cfg(unix)]
mod shared;

pub use child::{header_from_args, parse_header_arg, WorkerChannel};
pub use parent::{WorkerConnector, HEADER_ARG_PREFIX};
#[cfg(unix)]
pub use shared::{SharedWorkerAcceptor, SharedWorkerConnector, SharedWorkerServer};
