use tracing::debug;

use crate::context::TabletContext;
use crate::errors::{Result, fail};
use crate::executor::QueryExecutor;
use crate::tx::TransactionCoordinator;
use crate::types::{BoundQuery, Query, QueryList, QueryResult, SessionId, TxId};

/// A statement in a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statement<'a> {
    /// Literal `begin`, opens a transaction for the rest of the batch.
    Begin,
    /// Literal `commit`, commits the transaction opened by the batch.
    Commit,
    Query(&'a BoundQuery),
}

impl<'a> Statement<'a> {
    pub fn classify(query: &'a BoundQuery) -> Statement<'a> {
        let trimmed = query.sql.trim();
        if trimmed.eq_ignore_ascii_case("begin") {
            Statement::Begin
        } else if trimmed.eq_ignore_ascii_case("commit") {
            Statement::Commit
        } else {
            Statement::Query(query)
        }
    }
}

/// Executes an ordered list of statements, managing the transaction a batch
/// may open for itself.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    ctx: TabletContext,
    executor: QueryExecutor,
    tx: TransactionCoordinator,
}

/// Transaction bookkeeping for a single batch.
#[derive(Debug)]
struct BatchTx {
    session_id: SessionId,
    tx_id: TxId,
    /// Whether `tx_id` was opened by this batch, and so must be resolved by
    /// it.
    owned: bool,
}

impl BatchExecutor {
    pub fn new(ctx: TabletContext) -> Self {
        BatchExecutor {
            executor: QueryExecutor::new(ctx.clone()),
            tx: TransactionCoordinator::new(ctx.clone()),
            ctx,
        }
    }

    /// Execute every statement in order, returning one result per statement.
    ///
    /// `begin` and `commit` produce empty results. If the batch opens a
    /// transaction, it must also commit it. Any failure rolls back a
    /// transaction the batch opened and returns the original error.
    pub async fn execute_batch(&self, list: &QueryList) -> Result<Vec<QueryResult>> {
        self.ctx
            .classifier
            .handle(list, self.execute_batch_inner(list))
            .await
    }

    async fn execute_batch_inner(&self, list: &QueryList) -> Result<Vec<QueryResult>> {
        if list.queries.is_empty() {
            return Err(fail!("Empty query list"));
        }

        let _admitted = self
            .ctx
            .admission
            .admit(list.session_id, list.transaction_id != 0)?;

        let mut tx = BatchTx {
            session_id: list.session_id,
            tx_id: list.transaction_id,
            owned: false,
        };
        let mut results = Vec::with_capacity(list.queries.len());

        for bound in &list.queries {
            match Statement::classify(bound) {
                Statement::Begin => {
                    if tx.tx_id != 0 {
                        self.abort(&mut tx).await;
                        return Err(fail!("Nested transactions disallowed"));
                    }
                    tx.tx_id = self.tx.begin_recovered(tx.session_id).await?;
                    tx.owned = true;
                    results.push(QueryResult::default());
                }
                Statement::Commit => {
                    if !tx.owned {
                        return Err(fail!("Cannot commit without begin"));
                    }
                    self.tx.commit_recovered(tx.session_id, tx.tx_id).await?;
                    tx.tx_id = 0;
                    tx.owned = false;
                    results.push(QueryResult::default());
                }
                Statement::Query(bound) => {
                    let query = Query {
                        sql: bound.sql.clone(),
                        bind_vars: Some(bound.bind_vars.clone()),
                        transaction_id: tx.tx_id,
                        session_id: tx.session_id,
                    };
                    match self.executor.execute_recovered(&query).await {
                        Ok(result) => results.push(result),
                        Err(e) => {
                            self.abort(&mut tx).await;
                            return Err(e);
                        }
                    }
                }
            }
        }

        if tx.owned {
            self.abort(&mut tx).await;
            return Err(fail!("begin called with no commit"));
        }

        Ok(results)
    }

    /// Roll back the transaction if the batch opened it. A transaction
    /// carried in by the caller is left for the caller to resolve.
    async fn abort(&self, tx: &mut BatchTx) {
        if !tx.owned {
            return;
        }
        debug!(tx_id = tx.tx_id, "rolling back batch transaction");
        self.tx.rollback_best_effort(tx.session_id, tx.tx_id).await;
        tx.tx_id = 0;
        tx.owned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_statements() {
        let begin = BoundQuery::new("  BEGIN\n");
        let commit = BoundQuery::new("\tCommit ");
        let insert = BoundQuery::new("insert into t values (1)");
        let begin_work = BoundQuery::new("begin work");

        assert_eq!(Statement::Begin, Statement::classify(&begin));
        assert_eq!(Statement::Commit, Statement::classify(&commit));
        assert_eq!(Statement::Query(&insert), Statement::classify(&insert));
        assert_eq!(Statement::Query(&begin_work), Statement::classify(&begin_work));
    }
}
