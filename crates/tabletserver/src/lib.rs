//! Query serving core of a tablet.
//!
//! [`QueryService`] gates every request on a serving state machine and an
//! activation token, runs statements against an external storage engine, and
//! drains safely on shutdown.

pub mod admission;
pub mod backend;
pub mod batch;
pub mod classify;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod interrupt;
pub mod memory;
pub mod service;
pub mod session;
pub mod splitter;
pub mod state;
pub mod stats;
pub mod streams;
pub mod tracker;
pub mod tx;
pub mod types;

pub use config::{DbConfig, SchemaOverride, TabletConfig};
pub use errors::{BackendError, ErrorKind, Result, TabletError};
pub use interrupt::{Interrupt, spawn_signal_handler};
pub use service::{QueryService, ServiceStatus};
pub use state::ServingState;
