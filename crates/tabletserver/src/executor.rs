use std::time::Instant;

use futures::StreamExt;

use crate::backend::{BackendHandle, Deadline, Plan, StreamChunk};
use crate::context::TabletContext;
use crate::errors::{Result, fail, retry};
use crate::types::{BindVars, Query, QueryResult, TxId};

/// Receives the units of a streamed result.
pub type StreamSink<'a> = dyn FnMut(QueryResult) -> Result<()> + Send + 'a;

/// Strip trailing statement terminators and whitespace.
pub fn strip_trailing(sql: &str) -> &str {
    sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Runs single statements, unary or streamed.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    ctx: TabletContext,
}

impl QueryExecutor {
    pub fn new(ctx: TabletContext) -> Self {
        QueryExecutor { ctx }
    }

    pub async fn execute(&self, query: &Query) -> Result<QueryResult> {
        self.ctx
            .classifier
            .handle(query, self.execute_inner(query))
            .await
    }

    /// Execute without classifying the outcome, for callers that classify
    /// the request as a whole.
    pub(crate) async fn execute_recovered(&self, query: &Query) -> Result<QueryResult> {
        self.ctx
            .classifier
            .recover(query, self.execute_inner(query))
            .await
    }

    /// Stream the results of `query` into `sink`.
    ///
    /// The first unit sent carries only the fields, every following unit only
    /// rows. Returns once the stream completes, fails, or is terminated.
    pub async fn stream_execute<F>(&self, query: &Query, mut sink: F) -> Result<()>
    where
        F: FnMut(QueryResult) -> Result<()> + Send,
    {
        // Checked before admission so a rejected stream never counts as in
        // flight.
        if query.transaction_id != 0 {
            return self.ctx.classifier.classify(
                query,
                Err(fail!("Transactions not supported with streaming")),
            );
        }
        self.ctx
            .classifier
            .handle(query, self.stream_inner(query, &mut sink))
            .await
    }

    async fn execute_inner(&self, query: &Query) -> Result<QueryResult> {
        // Statements of an existing transaction may run while transactions
        // drain.
        let admitted = self
            .ctx
            .admission
            .admit(query.session_id, query.transaction_id != 0)?;

        let bind_vars = query.bind_vars.clone().unwrap_or_default();
        let sql = strip_trailing(&query.sql);
        let timeout = self.ctx.config.query_timeout;
        let deadline = self.ctx.query_deadline();
        let start = Instant::now();

        let plan = admitted.backend.schema.plan_for(sql)?;
        let result = self
            .ctx
            .bounded(
                deadline,
                run_plan(
                    &admitted.backend,
                    &plan,
                    &bind_vars,
                    query.transaction_id,
                    deadline,
                ),
                || fail!("query timed out after {timeout:?}"),
            )
            .await?;

        self.ctx.stats.record_timing(plan.kind.as_str(), start);
        Ok(result)
    }

    async fn stream_inner(&self, query: &Query, sink: &mut StreamSink<'_>) -> Result<()> {
        let admitted = self.ctx.admission.admit(query.session_id, false)?;

        let bind_vars = query.bind_vars.clone().unwrap_or_default();
        let sql = strip_trailing(&query.sql);
        let timeout = self.ctx.config.query_timeout;
        let deadline = self.ctx.query_deadline();
        let start = Instant::now();

        let plan = admitted.backend.schema.stream_plan_for(sql)?;
        let registration = self.ctx.streams.register(&plan.sql, &self.ctx.interrupt);
        let result = self
            .ctx
            .bounded(
                deadline,
                async {
                    tokio::select! {
                        result = pump_stream(&admitted.backend, &plan, &bind_vars, deadline, sink) => result,
                        _ = registration.terminated() => Err(retry!("stream terminated")),
                    }
                },
                || fail!("stream timed out after {timeout:?}"),
            )
            .await;
        drop(registration);

        self.ctx.stats.record_timing(plan.kind.as_str(), start);
        result
    }
}

async fn run_plan(
    backend: &BackendHandle,
    plan: &Plan,
    bind_vars: &BindVars,
    tx_id: TxId,
    deadline: Deadline,
) -> Result<QueryResult> {
    if tx_id != 0 {
        return Ok(backend
            .tx_pool
            .exec(tx_id, &plan.sql, bind_vars, deadline)
            .await?);
    }
    let mut conn = backend.get_conn(deadline).await?;
    Ok(conn.exec(&plan.sql, bind_vars).await?)
}

async fn pump_stream(
    backend: &BackendHandle,
    plan: &Plan,
    bind_vars: &BindVars,
    deadline: Deadline,
    sink: &mut StreamSink<'_>,
) -> Result<()> {
    let mut conn = backend.get_conn(deadline).await?;
    let mut stream = conn.stream(&plan.sql, bind_vars);

    let mut sent_fields = false;
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Fields(fields) => {
                if sent_fields {
                    return Err(fail!("received fields twice for stream"));
                }
                sent_fields = true;
                sink(QueryResult {
                    fields,
                    ..Default::default()
                })?;
            }
            StreamChunk::Rows(rows) => {
                if !sent_fields {
                    return Err(fail!("received rows before fields for stream"));
                }
                sink(QueryResult::from_rows(rows))?;
            }
        }
    }

    Ok(())
}
