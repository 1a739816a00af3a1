//! In-memory storage engine.
//!
//! Implements every backend collaborator with scripted responses and fault
//! injection. Used for testing the query service without a real database.

use std::collections::{BTreeSet, HashMap};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{
    BackendHandle,
    BackendOpener,
    ConnPool,
    DbConn,
    Deadline,
    Plan,
    PlanKind,
    SchemaInfo,
    StreamChunk,
    TableInfo,
    TxPool,
};
use crate::config::{DbConfig, SchemaOverride};
use crate::errors::{BackendError, BackendResult};
use crate::types::{BindVars, Field, QueryResult, TxId};

/// Scripted response for a statement.
#[derive(Debug, Clone)]
pub enum Response {
    Result(QueryResult),
    Error(BackendError),
    /// Panic with the given message.
    Panic(String),
    /// Never complete.
    Hang,
    /// Stream these chunks, in order.
    Stream(Vec<StreamChunk>),
    /// Stream the fields, then rows forever.
    StreamForever(Vec<Field>),
}

#[derive(Debug, Default)]
struct Faults {
    probe: Option<BackendError>,
    probe_delay: Duration,
    open: Option<BackendError>,
    panic_on_open: bool,
    ping: Option<BackendError>,
    rollback: Option<BackendError>,
}

#[derive(Debug)]
struct Transactions {
    next_id: TxId,
    open: BTreeSet<TxId>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    conns_in_use: AtomicUsize,
}

#[derive(Debug)]
struct EngineState {
    faults: Mutex<Faults>,
    tables: Mutex<HashMap<String, TableInfo>>,
    responses: Mutex<HashMap<String, Response>>,
    transactions: Mutex<Transactions>,
    /// Notified whenever a transaction ends.
    tx_ended: Notify,
    counters: Counters,
    executed: Mutex<Vec<String>>,
}

/// Storage engine keeping everything in memory.
///
/// Cloning returns a handle to the same engine.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    state: Arc<EngineState>,
}

pub const DEFAULT_TX_CAPACITY: usize = 16;

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_tx_capacity(DEFAULT_TX_CAPACITY)
    }

    /// Engine allowing at most `capacity` concurrently open transactions.
    pub fn with_tx_capacity(capacity: usize) -> Self {
        MemoryEngine {
            state: Arc::new(EngineState {
                faults: Mutex::new(Faults::default()),
                tables: Mutex::new(HashMap::new()),
                responses: Mutex::new(HashMap::new()),
                transactions: Mutex::new(Transactions {
                    next_id: 1,
                    open: BTreeSet::new(),
                    capacity,
                }),
                tx_ended: Notify::new(),
                counters: Counters::default(),
                executed: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fail_probe(&self, err: Option<BackendError>) {
        self.state.faults.lock().probe = err;
    }

    /// Make `probe` take at least `delay`.
    pub fn delay_probe(&self, delay: Duration) {
        self.state.faults.lock().probe_delay = delay;
    }

    pub fn fail_open(&self, err: Option<BackendError>) {
        self.state.faults.lock().open = err;
    }

    pub fn panic_on_open(&self, panic: bool) {
        self.state.faults.lock().panic_on_open = panic;
    }

    pub fn fail_ping(&self, err: Option<BackendError>) {
        self.state.faults.lock().ping = err;
    }

    /// Fail every rollback with `err`, leaving the transaction open.
    pub fn fail_rollback(&self, err: Option<BackendError>) {
        self.state.faults.lock().rollback = err;
    }

    /// Respond to `sql` with `response`. Statements without a response
    /// return an empty result.
    pub fn on_query(&self, sql: impl Into<String>, response: Response) {
        self.state.responses.lock().insert(sql.into(), response);
    }

    pub fn add_table(&self, table: TableInfo) {
        self.state.tables.lock().insert(table.name.clone(), table);
    }

    pub fn opened(&self) -> usize {
        self.state.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.counters.closed.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> usize {
        self.state.counters.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.state.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.counters.rollbacks.load(Ordering::SeqCst)
    }

    /// Connections currently checked out of the pool.
    pub fn conns_in_use(&self) -> usize {
        self.state.counters.conns_in_use.load(Ordering::SeqCst)
    }

    pub fn open_transactions(&self) -> usize {
        self.state.transactions.lock().open.len()
    }

    /// Every statement that reached the engine, in order. Statements run
    /// inside a transaction are prefixed with the transaction id.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    fn response_for(&self, sql: &str) -> Option<Response> {
        self.state.responses.lock().get(sql).cloned()
    }

    async fn respond(&self, sql: &str) -> BackendResult<QueryResult> {
        match self.response_for(sql) {
            None | Some(Response::Stream(_)) | Some(Response::StreamForever(_)) => {
                Ok(QueryResult::default())
            }
            Some(Response::Result(result)) => Ok(result),
            Some(Response::Error(err)) => Err(err),
            Some(Response::Panic(msg)) => panic!("{msg}"),
            Some(Response::Hang) => futures::future::pending().await,
        }
    }

    fn end_transaction(&self, tx_id: TxId) -> BackendResult<()> {
        let removed = self.state.transactions.lock().open.remove(&tx_id);
        if !removed {
            return Err(BackendError::TxNotFound(tx_id));
        }
        self.state.tx_ended.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BackendOpener for MemoryEngine {
    async fn probe(&self, _config: &DbConfig) -> BackendResult<()> {
        let (delay, probe_err) = {
            let faults = self.state.faults.lock();
            (faults.probe_delay, faults.probe.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match probe_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn open(
        &self,
        _config: &DbConfig,
        overrides: &[SchemaOverride],
    ) -> BackendResult<BackendHandle> {
        let (panic_on_open, open_err) = {
            let faults = self.state.faults.lock();
            (faults.panic_on_open, faults.open.clone())
        };
        if panic_on_open {
            panic!("failed to load schema");
        }
        if let Some(err) = open_err {
            return Err(err);
        }

        {
            let mut tables = self.state.tables.lock();
            for schema_override in overrides {
                if let Some(table) = tables.get_mut(&schema_override.name) {
                    table.pk_columns = schema_override
                        .pk_columns
                        .iter()
                        .filter_map(|name| table.columns.iter().position(|c| &c.name == name))
                        .collect();
                }
            }
        }

        self.state.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(BackendHandle {
            conn_pool: Arc::new(self.clone()),
            tx_pool: Arc::new(self.clone()),
            schema: Arc::new(self.clone()),
        })
    }

    async fn close(&self, _handle: Option<BackendHandle>) {
        self.state.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnPool for MemoryEngine {
    async fn acquire(&self, _deadline: Deadline) -> BackendResult<Box<dyn DbConn>> {
        self.state.counters.conns_in_use.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConn {
            engine: self.clone(),
        }))
    }

    fn release(&self, _conn: Box<dyn DbConn>) {
        self.state.counters.conns_in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct MemoryConn {
    engine: MemoryEngine,
}

#[async_trait]
impl DbConn for MemoryConn {
    async fn exec(&mut self, sql: &str, _bind_vars: &BindVars) -> BackendResult<QueryResult> {
        self.engine.state.executed.lock().push(sql.to_string());
        self.engine.respond(sql).await
    }

    fn stream(
        &mut self,
        sql: &str,
        _bind_vars: &BindVars,
    ) -> BoxStream<'static, BackendResult<StreamChunk>> {
        self.engine.state.executed.lock().push(sql.to_string());
        match self.engine.response_for(sql) {
            Some(Response::Stream(chunks)) => stream::iter(chunks.into_iter().map(Ok)).boxed(),
            Some(Response::StreamForever(fields)) => {
                let rows = stream::unfold(0_i64, |n| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let chunk = StreamChunk::Rows(vec![vec![n.into()]]);
                    Some((Ok::<_, BackendError>(chunk), n + 1))
                });
                stream::once(async move { Ok(StreamChunk::Fields(fields)) })
                    .chain(rows)
                    .boxed()
            }
            Some(Response::Error(err)) => stream::once(async move { Err(err) }).boxed(),
            Some(Response::Panic(msg)) => panic!("{msg}"),
            Some(Response::Hang) => stream::pending().boxed(),
            Some(Response::Result(result)) => stream::iter([
                Ok(StreamChunk::Fields(result.fields)),
                Ok(StreamChunk::Rows(result.rows)),
            ])
            .boxed(),
            None => stream::once(async { Ok(StreamChunk::Fields(Vec::new())) }).boxed(),
        }
    }

    async fn ping(&mut self) -> BackendResult<()> {
        match self.engine.state.faults.lock().ping.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TxPool for MemoryEngine {
    async fn begin(&self, deadline: Deadline) -> BackendResult<TxId> {
        loop {
            let mut ended = pin!(self.state.tx_ended.notified());
            ended.as_mut().enable();
            {
                let mut txs = self.state.transactions.lock();
                if txs.open.len() < txs.capacity {
                    let tx_id = txs.next_id;
                    txs.next_id += 1;
                    txs.open.insert(tx_id);
                    self.state.counters.begins.fetch_add(1, Ordering::SeqCst);
                    return Ok(tx_id);
                }
            }
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, ended)
                    .await
                    .map_err(|_| BackendError::TxPoolFull)?,
                None => ended.await,
            }
        }
    }

    async fn commit(&self, tx_id: TxId, _deadline: Deadline) -> BackendResult<()> {
        self.end_transaction(tx_id)?;
        self.state.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx_id: TxId, _deadline: Deadline) -> BackendResult<()> {
        let rollback_err = self.state.faults.lock().rollback.clone();
        if let Some(err) = rollback_err {
            return Err(err);
        }
        self.end_transaction(tx_id)?;
        self.state.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(
        &self,
        tx_id: TxId,
        sql: &str,
        _bind_vars: &BindVars,
        _deadline: Deadline,
    ) -> BackendResult<QueryResult> {
        if !self.state.transactions.lock().open.contains(&tx_id) {
            return Err(BackendError::TxNotFound(tx_id));
        }
        self.state.executed.lock().push(format!("[{tx_id}] {sql}"));
        self.respond(sql).await
    }

    async fn wait_empty(&self) {
        loop {
            let mut ended = pin!(self.state.tx_ended.notified());
            ended.as_mut().enable();
            if self.state.transactions.lock().open.is_empty() {
                return;
            }
            ended.await;
        }
    }

    fn open_count(&self) -> usize {
        self.state.transactions.lock().open.len()
    }
}

impl SchemaInfo for MemoryEngine {
    fn plan_for(&self, sql: &str) -> BackendResult<Plan> {
        let keyword = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let kind = match keyword.as_str() {
            "select" => PlanKind::Select,
            "insert" => PlanKind::Insert,
            "update" => PlanKind::Update,
            "delete" => PlanKind::Delete,
            "create" | "alter" | "drop" | "rename" | "truncate" => PlanKind::Ddl,
            "set" => PlanKind::Set,
            "" => return Err(BackendError::Other("empty statement".to_string())),
            _ => PlanKind::Other,
        };
        Ok(Plan {
            kind,
            table: None,
            sql: sql.to_string(),
        })
    }

    fn stream_plan_for(&self, sql: &str) -> BackendResult<Plan> {
        let plan = self.plan_for(sql)?;
        if plan.kind != PlanKind::Select {
            return Err(BackendError::Other(format!(
                "stream is only supported for select statements: {sql}"
            )));
        }
        Ok(Plan {
            kind: PlanKind::SelectStream,
            ..plan
        })
    }

    fn table(&self, name: &str) -> Option<TableInfo> {
        self.state.tables.lock().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::types::FieldType;

    #[tokio::test]
    async fn tx_capacity_is_enforced() {
        let engine = MemoryEngine::with_tx_capacity(1);
        let tx = engine.begin(None).await.unwrap();

        let deadline = Some(Instant::now() + Duration::from_millis(20));
        let err = engine.begin(deadline).await.unwrap_err();
        assert_eq!(BackendError::TxPoolFull, err);

        engine.commit(tx, None).await.unwrap();
        let tx2 = engine.begin(deadline).await.unwrap();
        assert_ne!(tx, tx2);
        assert_eq!(
            BackendError::TxNotFound(tx),
            engine.rollback(tx, None).await.unwrap_err()
        );
        assert_eq!(1, engine.open_count());
    }

    #[tokio::test]
    async fn begin_waits_for_slot() {
        let engine = MemoryEngine::with_tx_capacity(1);
        let tx = engine.begin(None).await.unwrap();

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.begin(None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        engine.rollback(tx, None).await.unwrap();
        let tx2 = waiter.await.unwrap().unwrap();
        assert_eq!(2, tx2);
    }

    #[tokio::test]
    async fn connections_are_counted() {
        let engine = MemoryEngine::new();
        let handle = engine.open(&DbConfig::default(), &[]).await.unwrap();

        let conn = handle.get_conn(None).await.unwrap();
        assert_eq!(1, engine.conns_in_use());
        drop(conn);
        assert_eq!(0, engine.conns_in_use());
    }

    #[tokio::test]
    async fn schema_overrides_set_primary_key() {
        let engine = MemoryEngine::new();
        engine.add_table(TableInfo::new(
            "view_users",
            vec![
                Field::new("name", FieldType::Text),
                Field::new("id", FieldType::Int),
            ],
            vec![],
        ));

        let overrides = [SchemaOverride {
            name: "view_users".to_string(),
            pk_columns: vec!["id".to_string()],
        }];
        let handle = engine.open(&DbConfig::default(), &overrides).await.unwrap();

        let table = handle.schema.table("view_users").unwrap();
        assert_eq!(vec![1], table.pk_columns);
    }

    #[test]
    fn plans() {
        let engine = MemoryEngine::new();
        assert_eq!(PlanKind::Insert, engine.plan_for("INSERT into t values (1)").unwrap().kind);
        assert_eq!(
            PlanKind::SelectStream,
            engine.stream_plan_for("select * from t").unwrap().kind
        );
        assert!(engine.stream_plan_for("delete from t").is_err());
        assert!(engine.plan_for("   ").is_err());
    }
}
