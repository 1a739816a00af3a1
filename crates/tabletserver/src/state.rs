use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Lifecycle state of the query service.
///
/// ```text
/// NOT_SERVING -> INITIALIZING -> SERVING | NOT_SERVING
/// SERVING -> SHUTTING_DOWN_TX -> SHUTTING_DOWN_QUERIES -> NOT_SERVING
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ServingState {
    /// Not serving queries.
    #[default]
    NotServing = 0,
    /// Transient state while trying to get to `Serving`. Only informational.
    Initializing = 1,
    /// Everything is allowed.
    Serving = 2,
    /// New transactions are disallowed. Statements that are part of an
    /// existing transaction are still allowed until every transaction has
    /// completed.
    ShuttingDownTx = 3,
    /// No new requests are allowed. Remains here until every in-flight
    /// request has completed.
    ShuttingDownQueries = 4,
}

impl ServingState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ServingState::NotServing => "NOT_SERVING",
            ServingState::Initializing => "INITIALIZING",
            ServingState::Serving => "SERVING",
            ServingState::ShuttingDownTx => "SHUTTING_DOWN_TX",
            ServingState::ShuttingDownQueries => "SHUTTING_DOWN_QUERIES",
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub const fn can_transition_to(&self, next: ServingState) -> bool {
        matches!(
            (self, next),
            (ServingState::NotServing, ServingState::Initializing)
                | (ServingState::Initializing, ServingState::Serving)
                | (ServingState::Initializing, ServingState::NotServing)
                | (ServingState::Serving, ServingState::ShuttingDownTx)
                | (ServingState::ShuttingDownTx, ServingState::ShuttingDownQueries)
                | (ServingState::ShuttingDownQueries, ServingState::NotServing)
        )
    }

    const fn from_u8(v: u8) -> ServingState {
        match v {
            1 => ServingState::Initializing,
            2 => ServingState::Serving,
            3 => ServingState::ShuttingDownTx,
            4 => ServingState::ShuttingDownQueries,
            _ => ServingState::NotServing,
        }
    }
}

impl fmt::Display for ServingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lock-free copy of the serving state.
///
/// Only written while holding the exclusive transition lock. Loads are a
/// best-effort snapshot and must not gate admission decisions.
#[derive(Debug)]
pub(crate) struct AtomicServingState(AtomicU8);

impl AtomicServingState {
    pub(crate) const fn new(state: ServingState) -> Self {
        AtomicServingState(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ServingState {
        ServingState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ServingState) {
        self.0.store(state as u8, Ordering::Release)
    }
}
