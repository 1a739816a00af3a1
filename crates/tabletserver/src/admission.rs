use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::backend::{BackendHandle, BackendOpener};
use crate::classify::panic_message;
use crate::config::{DbConfig, SchemaOverride};
use crate::errors::{Result, fatal, retry};
use crate::session::SessionGuard;
use crate::state::{AtomicServingState, ServingState};
use crate::streams::StreamQueryList;
use crate::tracker::{RequestGuard, RequestTracker};
use crate::types::{SessionId, SessionParams};

/// Everything guarded by the serving state lock.
#[derive(Debug, Default)]
struct Register {
    state: ServingState,
    session: SessionGuard,
    db: DbConfig,
    /// Only set while `SERVING`, `SHUTTING_DOWN_TX` or
    /// `SHUTTING_DOWN_QUERIES`.
    backend: Option<BackendHandle>,
}

/// Serving state machine gating which requests may start.
///
/// Transitions take the register lock exclusively, admission checks take it
/// shared. The lock is never held across an await. Claiming a transition
/// happens by moving into `INITIALIZING` or `SHUTTING_DOWN_TX`, so concurrent
/// `start` and `drain` calls observe the claim and back off.
#[derive(Debug)]
pub struct RequestAdmission {
    register: RwLock<Register>,
    /// Lock free copy of `register.state`. Only used for the "already
    /// serving" fast path and status reporting.
    state: AtomicServingState,
    tracker: Arc<RequestTracker>,
}

/// A successfully admitted request.
///
/// Holds the backend handles for the lifetime of the request. The request
/// completes when this is dropped.
#[derive(Debug)]
pub struct Admitted {
    pub backend: BackendHandle,
    _guard: RequestGuard,
}

impl Default for RequestAdmission {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAdmission {
    pub fn new() -> Self {
        RequestAdmission {
            register: RwLock::new(Register::default()),
            state: AtomicServingState::new(ServingState::NotServing),
            tracker: Arc::new(RequestTracker::new()),
        }
    }

    /// Best effort snapshot of the current state.
    pub fn state(&self) -> ServingState {
        self.state.load()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Current activation token, zero when not serving.
    pub fn session_id(&self) -> SessionId {
        self.register.read().session.current()
    }

    fn set_state(&self, register: &mut Register, next: ServingState) {
        debug_assert!(
            register.state.can_transition_to(next),
            "invalid transition {} -> {next}",
            register.state
        );
        info!(from = %register.state, to = %next, "query service state change");
        register.state = next;
        self.state.store(next);
    }

    fn revert_to_not_serving(&self) {
        let mut register = self.register.write();
        self.set_state(&mut register, ServingState::NotServing);
    }

    /// Bring up the backend and start serving.
    ///
    /// No-op if already serving. Fails if a transition is in progress.
    ///
    /// The transition runs on its own task. Dropping the returned future
    /// stops waiting for it, the transition still completes or reverts.
    pub async fn start(
        self: &Arc<Self>,
        opener: Arc<dyn BackendOpener>,
        db: &DbConfig,
        overrides: &[SchemaOverride],
    ) -> Result<()> {
        if self.state.load() == ServingState::Serving {
            return Ok(());
        }

        let admission = self.clone();
        let db = db.clone();
        let overrides = overrides.to_vec();
        let transition = tokio::spawn(async move {
            admission
                .run_start(opener.as_ref(), &db, &overrides)
                .await
        });

        match transition.await {
            Ok(result) => result,
            Err(e) => Err(fatal!("could not start query service: {e}")),
        }
    }

    async fn run_start(
        &self,
        opener: &dyn BackendOpener,
        db: &DbConfig,
        overrides: &[SchemaOverride],
    ) -> Result<()> {
        {
            let mut register = self.register.write();
            if register.state != ServingState::NotServing {
                return Err(fatal!(
                    "cannot start query service, current state: {}",
                    register.state
                ));
            }
            self.set_state(&mut register, ServingState::Initializing);
        }

        match AssertUnwindSafe(opener.probe(db)).catch_unwind().await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => {
                info!(%e, "backend probe failed");
                self.revert_to_not_serving();
                return Err(e.into());
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(%msg, "backend probe panicked");
                self.revert_to_not_serving();
                return Err(fatal!("could not start query service: {msg}"));
            }
        }

        let backend = match AssertUnwindSafe(opener.open(db, overrides))
            .catch_unwind()
            .await
        {
            Ok(Ok(backend)) => backend,
            Ok(Err(e)) => {
                error!(%e, "could not start query service");
                opener.close(None).await;
                self.revert_to_not_serving();
                return Err(fatal!("could not start query service: {e}"));
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(%msg, "could not start query service, open panicked");
                opener.close(None).await;
                self.revert_to_not_serving();
                return Err(fatal!("could not start query service: {msg}"));
            }
        };

        let mut register = self.register.write();
        register.db = db.clone();
        register.backend = Some(backend);
        let session_id = register.session.activate();
        info!(session_id, keyspace = %db.keyspace, shard = %db.shard, "query service started");
        self.set_state(&mut register, ServingState::Serving);

        Ok(())
    }

    /// Stop serving.
    ///
    /// Waits for open transactions to finish, then terminates streams and
    /// waits for every in-flight request before closing the backend. No-op if
    /// not serving.
    ///
    /// Like [`Self::start`], the drain runs on its own task and completes
    /// even if the returned future is dropped.
    pub async fn drain(
        self: &Arc<Self>,
        opener: Arc<dyn BackendOpener>,
        streams: Arc<StreamQueryList>,
    ) {
        let admission = self.clone();
        let transition = tokio::spawn(async move {
            admission.run_drain(opener.as_ref(), &streams).await
        });

        if let Err(e) = transition.await {
            error!(%e, "draining query service failed");
        }
    }

    async fn run_drain(&self, opener: &dyn BackendOpener, streams: &StreamQueryList) {
        let tx_pool = {
            let mut register = self.register.write();
            if register.state != ServingState::Serving {
                return;
            }
            self.set_state(&mut register, ServingState::ShuttingDownTx);
            register.backend.as_ref().map(|b| b.tx_pool.clone())
        };

        if let Some(tx_pool) = tx_pool {
            tx_pool.wait_empty().await;
        }

        {
            let mut register = self.register.write();
            self.set_state(&mut register, ServingState::ShuttingDownQueries);
        }

        let terminated = streams.terminate_all();
        if terminated > 0 {
            info!(terminated, "terminated streaming queries");
        }
        self.tracker.wait_idle().await;

        let backend = {
            let mut register = self.register.write();
            info!(session_id = register.session.current(), "stopping query service");
            register.session.clear();
            register.db = DbConfig::default();
            register.backend.take()
        };
        if backend.is_none() {
            warn!("no backend bound while draining");
        }
        opener.close(backend).await;
        streams.reopen();

        self.revert_to_not_serving();
    }

    /// Check the state and session for a new request and register it as in
    /// flight.
    ///
    /// `allow_during_tx_drain` lets statements belonging to an existing
    /// transaction through while new transactions are barred.
    pub fn admit(&self, session_id: SessionId, allow_during_tx_drain: bool) -> Result<Admitted> {
        let register = self.register.read();
        match register.state {
            ServingState::Serving => (),
            ServingState::ShuttingDownTx if allow_during_tx_drain => (),
            state => return Err(retry!("operation not allowed in state {state}")),
        }
        register.session.validate(session_id)?;

        let backend = register
            .backend
            .clone()
            .ok_or_else(|| fatal!("no backend bound in state {}", register.state))?;

        Ok(Admitted {
            backend,
            _guard: self.tracker.start(),
        })
    }

    /// Return the activation token if the client is addressing the bound
    /// keyspace and shard.
    pub fn session_for(&self, params: &SessionParams) -> Result<SessionId> {
        let register = self.register.read();
        if register.state != ServingState::Serving {
            return Err(retry!("Query server is in {} state", register.state));
        }
        if params.keyspace != register.db.keyspace {
            return Err(fatal!(
                "Keyspace mismatch, expecting {}, received {}",
                register.db.keyspace,
                params.keyspace
            ));
        }
        if !params.shard.eq_ignore_ascii_case(&register.db.shard) {
            return Err(fatal!(
                "Shard mismatch, expecting {}, received {}",
                register.db.shard,
                params.shard
            ));
        }
        Ok(register.session.current())
    }
}
