//! L7 proxy port lifecycle management.
//!
//! This crate maps logical, policy-defined listeners (a named, typed,
//! directional L7 entry point) to concrete ephemeral ports that a local
//! L7 proxy binds to, and coordinates handing those ports into the
//! datapath rules that redirect matching traffic:
//!
//! - [`ProxyPortManager`] owns the registry, the allocator, and the
//!   redirect lifecycle (allocate / ack / release).
//! - [`DatapathUpdater`] is the consumed interface to the rule
//!   installation backend.
//! - Allocations survive agent restarts through a debounced JSON
//!   checkpoint ([`checkpoint`]), restored at startup subject to an age
//!   limit.
//!
//! Port numbers are a host-wide shared resource; the allocator verifies
//! OS-level availability with a live bind probe instead of trusting its
//! in-memory bookkeeping alone.

pub mod checkpoint;
pub mod config;
pub mod datapath;
pub mod error;
pub mod manager;
mod ports;
pub mod redirect;
pub mod registry;

pub use checkpoint::{CheckpointStore, ProxyPortRecord, CHECKPOINT_FILENAME};
pub use config::ProxyConfig;
pub use datapath::{DatapathUpdater, MockDatapath};
pub use error::ProxyError;
pub use manager::ProxyPortManager;
pub use redirect::{
    FinalizeFn, ParserType, Protocol, RedirectRules, RedirectSpec, RedirectUpdate, RevertFn,
};
pub use registry::{ProxyPort, ProxyPortRegistry, ProxyType};
