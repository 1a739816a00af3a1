use std::time::Instant;

use tracing::{debug, warn};

use crate::context::TabletContext;
use crate::errors::{BackendError, ErrorKind, Result, TabletError, fail};
use crate::types::{SessionId, TxId};

/// Begin, commit and rollback against the transaction pool.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    ctx: TabletContext,
}

impl TransactionCoordinator {
    pub fn new(ctx: TabletContext) -> Self {
        TransactionCoordinator { ctx }
    }

    pub async fn begin(&self, session_id: SessionId) -> Result<TxId> {
        self.ctx
            .classifier
            .handle(&"begin", self.begin_inner(session_id))
            .await
    }

    pub async fn commit(&self, session_id: SessionId, tx_id: TxId) -> Result<()> {
        let context = format!("commit, TransactionId: {tx_id}");
        self.ctx
            .classifier
            .handle(&context, self.commit_inner(session_id, tx_id))
            .await
    }

    pub async fn rollback(&self, session_id: SessionId, tx_id: TxId) -> Result<()> {
        let context = format!("rollback, TransactionId: {tx_id}");
        self.ctx
            .classifier
            .handle(&context, self.rollback_inner(session_id, tx_id, false))
            .await
    }

    /// Begin without classifying the outcome, for callers that classify the
    /// request as a whole.
    pub(crate) async fn begin_recovered(&self, session_id: SessionId) -> Result<TxId> {
        self.ctx
            .classifier
            .recover(&"begin", self.begin_inner(session_id))
            .await
    }

    pub(crate) async fn commit_recovered(&self, session_id: SessionId, tx_id: TxId) -> Result<()> {
        self.ctx
            .classifier
            .recover(&"commit", self.commit_inner(session_id, tx_id))
            .await
    }

    /// Roll back a transaction after another failure.
    ///
    /// Never fails. A transaction that is already gone is ignored, anything
    /// else is logged.
    pub(crate) async fn rollback_best_effort(&self, session_id: SessionId, tx_id: TxId) {
        let result = self
            .ctx
            .classifier
            .recover(&"rollback", self.rollback_inner(session_id, tx_id, true))
            .await;
        if let Err(e) = result {
            warn!(%e, tx_id, "failed to roll back transaction");
        }
    }

    async fn begin_inner(&self, session_id: SessionId) -> Result<TxId> {
        // New transactions are barred once draining starts.
        let admitted = self.ctx.admission.admit(session_id, false)?;
        let start = Instant::now();

        let timeout = self.ctx.config.tx_pool_timeout;
        let deadline = TabletContext::deadline_after(timeout);
        let tx_pool = &admitted.backend.tx_pool;
        let tx_id = self
            .ctx
            .bounded(
                deadline,
                async { tx_pool.begin(deadline).await.map_err(TabletError::from) },
                || {
                    TabletError::new(
                        ErrorKind::TxPoolFull,
                        format!("Transaction pool connection limit exceeded after {timeout:?}"),
                    )
                },
            )
            .await?;

        self.ctx.stats.record_timing("BEGIN", start);
        debug!(session_id, tx_id, "began transaction");
        Ok(tx_id)
    }

    async fn commit_inner(&self, session_id: SessionId, tx_id: TxId) -> Result<()> {
        let admitted = self.ctx.admission.admit(session_id, true)?;
        let start = Instant::now();

        let timeout = self.ctx.config.query_timeout;
        let deadline = self.ctx.query_deadline();
        let tx_pool = &admitted.backend.tx_pool;
        self.ctx
            .bounded(
                deadline,
                async { tx_pool.commit(tx_id, deadline).await.map_err(TabletError::from) },
                || fail!("commit of transaction {tx_id} timed out after {timeout:?}"),
            )
            .await?;

        self.ctx.stats.record_timing("COMMIT", start);
        debug!(session_id, tx_id, "committed transaction");
        Ok(())
    }

    async fn rollback_inner(
        &self,
        session_id: SessionId,
        tx_id: TxId,
        ignore_missing: bool,
    ) -> Result<()> {
        let admitted = self.ctx.admission.admit(session_id, true)?;
        let start = Instant::now();

        let timeout = self.ctx.config.query_timeout;
        let deadline = self.ctx.query_deadline();
        let tx_pool = &admitted.backend.tx_pool;
        self.ctx
            .bounded(
                deadline,
                async {
                    match tx_pool.rollback(tx_id, deadline).await {
                        Err(BackendError::TxNotFound(_)) if ignore_missing => {
                            debug!(tx_id, "transaction already gone");
                            Ok(())
                        }
                        result => result.map_err(TabletError::from),
                    }
                },
                || fail!("rollback of transaction {tx_id} timed out after {timeout:?}"),
            )
            .await?;

        self.ctx.stats.record_timing("ROLLBACK", start);
        debug!(session_id, tx_id, "rolled back transaction");
        Ok(())
    }
}

