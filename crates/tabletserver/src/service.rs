use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::error;

use crate::admission::Admitted;
use crate::backend::BackendOpener;
use crate::batch::BatchExecutor;
use crate::classify::panic_message;
use crate::config::{DbConfig, SchemaOverride, TabletConfig};
use crate::context::TabletContext;
use crate::errors::{Result, fail};
use crate::executor::QueryExecutor;
use crate::interrupt::Interrupt;
use crate::splitter::{QuerySplitter, fetch_min_max};
use crate::state::ServingState;
use crate::stats::StatsSnapshot;
use crate::tx::TransactionCoordinator;
use crate::types::{
    Query,
    QueryList,
    QueryResult,
    QuerySplit,
    SessionId,
    SessionParams,
    SplitQueryRequest,
    TxId,
};

/// Point in time view of the service for health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServingState,
    pub state_name: &'static str,
    /// Whether the backend answered a ping. Always true when not serving.
    pub backend_reachable: bool,
    pub in_flight: usize,
    pub open_transactions: usize,
}

/// The query service of a tablet.
///
/// Gates every request on the serving state and session, then hands it to
/// the executor, batch executor, transaction coordinator or splitter.
pub struct QueryService {
    ctx: TabletContext,
    opener: Arc<dyn BackendOpener>,
    executor: QueryExecutor,
    tx: TransactionCoordinator,
    batch: BatchExecutor,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl QueryService {
    pub fn new(config: TabletConfig, opener: Arc<dyn BackendOpener>) -> Self {
        Self::with_interrupt(config, opener, Interrupt::new())
    }

    /// Create a service whose blocking waits end when `interrupt` triggers.
    pub fn with_interrupt(
        config: TabletConfig,
        opener: Arc<dyn BackendOpener>,
        interrupt: Interrupt,
    ) -> Self {
        let ctx = TabletContext::new(config, interrupt);
        QueryService {
            executor: QueryExecutor::new(ctx.clone()),
            tx: TransactionCoordinator::new(ctx.clone()),
            batch: BatchExecutor::new(ctx.clone()),
            opener,
            ctx,
        }
    }

    /// Start serving queries against `db`.
    pub async fn allow_queries(&self, db: &DbConfig, overrides: &[SchemaOverride]) -> Result<()> {
        self.ctx
            .admission
            .start(self.opener.clone(), db, overrides)
            .await
    }

    /// Stop serving, waiting for open transactions and in-flight requests.
    ///
    /// Dropping the returned future doesn't abandon the drain.
    pub async fn disallow_queries(&self) {
        self.ctx
            .admission
            .drain(self.opener.clone(), self.ctx.streams.clone())
            .await
    }

    pub fn get_session_id(&self, params: &SessionParams) -> Result<SessionId> {
        self.ctx.admission.session_for(params)
    }

    pub async fn begin(&self, session_id: SessionId) -> Result<TxId> {
        self.tx.begin(session_id).await
    }

    pub async fn commit(&self, session_id: SessionId, tx_id: TxId) -> Result<()> {
        self.tx.commit(session_id, tx_id).await
    }

    pub async fn rollback(&self, session_id: SessionId, tx_id: TxId) -> Result<()> {
        self.tx.rollback(session_id, tx_id).await
    }

    pub async fn execute(&self, query: &Query) -> Result<QueryResult> {
        self.executor.execute(query).await
    }

    pub async fn stream_execute<F>(&self, query: &Query, sink: F) -> Result<()>
    where
        F: FnMut(QueryResult) -> Result<()> + Send,
    {
        self.executor.stream_execute(query, sink).await
    }

    pub async fn execute_batch(&self, list: &QueryList) -> Result<Vec<QueryResult>> {
        self.batch.execute_batch(list).await
    }

    /// Split a full table scan into queries over primary key ranges.
    pub async fn split_query(&self, req: &SplitQueryRequest) -> Result<Vec<QuerySplit>> {
        self.ctx
            .classifier
            .handle(&req.query, self.split_query_inner(req))
            .await
    }

    async fn split_query_inner(&self, req: &SplitQueryRequest) -> Result<Vec<QuerySplit>> {
        let admitted = self.ctx.admission.admit(req.session_id, false)?;
        let splitter =
            QuerySplitter::new(&req.query, req.split_count, admitted.backend.schema.as_ref())?;
        if splitter.split_count() == 1 {
            return Ok(splitter.unsplit());
        }

        let timeout = self.ctx.config.query_timeout;
        let deadline = self.ctx.query_deadline();
        let min_max = self
            .ctx
            .bounded(
                deadline,
                fetch_min_max(&admitted.backend, &splitter, deadline),
                || fail!("split query timed out after {timeout:?}"),
            )
            .await?;

        splitter.split(&min_max)
    }

    pub async fn status(&self) -> ServiceStatus {
        let state = self.ctx.admission.state();
        let session_id = self.ctx.admission.session_id();
        let (backend_reachable, open_transactions) =
            match self.ctx.admission.admit(session_id, false) {
                // Not serving, nothing to check.
                Err(_) => (true, 0),
                Ok(admitted) => {
                    let open = admitted.backend.tx_pool.open_count();
                    (self.check_backend(admitted).await, open)
                }
            };

        ServiceStatus {
            state,
            state_name: state.as_str(),
            backend_reachable,
            in_flight: self.in_flight(),
            open_transactions,
        }
    }

    async fn check_backend(&self, admitted: Admitted) -> bool {
        let deadline = self.ctx.query_deadline();
        let ping = async {
            match admitted.backend.get_conn(deadline).await {
                Ok(mut conn) => conn.ping().await,
                Err(e) => Err(e),
            }
        };
        match AssertUnwindSafe(ping).catch_unwind().await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(%e, "backend unreachable");
                false
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(%msg, "checking backend, unexpected panic");
                false
            }
        }
    }

    /// Best effort snapshot of the serving state.
    pub fn state(&self) -> ServingState {
        self.ctx.admission.state()
    }

    pub fn in_flight(&self) -> usize {
        self.ctx.admission.in_flight()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot(self.state())
    }

    pub fn context(&self) -> &TabletContext {
        &self.ctx
    }
}
