//! Interfaces to the storage engine.
//!
//! The query service never owns connections or transactions itself. It checks
//! handles out of these collaborators and always hands them back.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{DbConfig, SchemaOverride};
use crate::errors::BackendResult;
use crate::types::{BindVars, Field, QueryResult, Row, TxId};

/// Point in time a backend call must complete by. `None` means no deadline.
pub type Deadline = Option<Instant>;

/// Opens and closes the backend binding.
#[async_trait]
pub trait BackendOpener: Send + Sync {
    /// Lightweight connectivity check run before opening anything.
    async fn probe(&self, config: &DbConfig) -> BackendResult<()>;

    /// Open the connection pool, transaction pool and schema cache.
    async fn open(
        &self,
        config: &DbConfig,
        overrides: &[SchemaOverride],
    ) -> BackendResult<BackendHandle>;

    /// Close a binding.
    ///
    /// `None` is passed when `open` failed part way, in which case whatever
    /// was partially opened must be closed.
    async fn close(&self, handle: Option<BackendHandle>);
}

/// Handles for an open backend binding.
#[derive(Clone)]
pub struct BackendHandle {
    pub conn_pool: Arc<dyn ConnPool>,
    pub tx_pool: Arc<dyn TxPool>,
    pub schema: Arc<dyn SchemaInfo>,
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("open_transactions", &self.tx_pool.open_count())
            .finish_non_exhaustive()
    }
}

impl BackendHandle {
    /// Check out a connection, returned to the pool when the guard drops.
    pub async fn get_conn(&self, deadline: Deadline) -> BackendResult<PooledConn> {
        let conn = self.conn_pool.acquire(deadline).await?;
        Ok(PooledConn {
            pool: self.conn_pool.clone(),
            conn: Some(conn),
        })
    }
}

#[async_trait]
pub trait ConnPool: Send + Sync {
    async fn acquire(&self, deadline: Deadline) -> BackendResult<Box<dyn DbConn>>;

    fn release(&self, conn: Box<dyn DbConn>);
}

/// A single connection to the storage engine.
#[async_trait]
pub trait DbConn: Send {
    async fn exec(&mut self, sql: &str, bind_vars: &BindVars) -> BackendResult<QueryResult>;

    /// Stream the results of a query.
    ///
    /// A well behaved stream yields a single `Fields` chunk followed by any
    /// number of `Rows` chunks.
    fn stream(
        &mut self,
        sql: &str,
        bind_vars: &BindVars,
    ) -> BoxStream<'static, BackendResult<StreamChunk>>;

    async fn ping(&mut self) -> BackendResult<()>;
}

/// Connection checked out of a [`ConnPool`].
pub struct PooledConn {
    pool: Arc<dyn ConnPool>,
    conn: Option<Box<dyn DbConn>>,
}

impl fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl Deref for PooledConn {
    type Target = dyn DbConn;

    fn deref(&self) -> &Self::Target {
        // Only taken on drop.
        self.conn.as_deref().expect("connection to be present")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection to be present")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Transactions are owned by the pool. The query service only refers to them
/// by id.
#[async_trait]
pub trait TxPool: Send + Sync {
    /// Reserve a connection and begin a transaction on it.
    ///
    /// Fails with `TxPoolFull` if no slot frees up before the deadline.
    async fn begin(&self, deadline: Deadline) -> BackendResult<TxId>;

    async fn commit(&self, tx_id: TxId, deadline: Deadline) -> BackendResult<()>;

    async fn rollback(&self, tx_id: TxId, deadline: Deadline) -> BackendResult<()>;

    /// Execute a statement on the connection reserved for a transaction.
    async fn exec(
        &self,
        tx_id: TxId,
        sql: &str,
        bind_vars: &BindVars,
        deadline: Deadline,
    ) -> BackendResult<QueryResult>;

    /// Resolves once no transactions are open.
    async fn wait_empty(&self);

    fn open_count(&self) -> usize;
}

/// Plan and table metadata cache.
pub trait SchemaInfo: Send + Sync {
    fn plan_for(&self, sql: &str) -> BackendResult<Plan>;

    fn stream_plan_for(&self, sql: &str) -> BackendResult<Plan>;

    fn table(&self, name: &str) -> Option<TableInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlanKind {
    Select,
    SelectStream,
    Insert,
    Update,
    Delete,
    Ddl,
    Set,
    Other,
}

impl PlanKind {
    /// Name used for statement timings.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Select => "SELECT",
            PlanKind::SelectStream => "SELECT_STREAM",
            PlanKind::Insert => "INSERT",
            PlanKind::Update => "UPDATE",
            PlanKind::Delete => "DELETE",
            PlanKind::Ddl => "DDL",
            PlanKind::Set => "SET",
            PlanKind::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub kind: PlanKind,
    /// Table the statement targets, if it targets exactly one.
    pub table: Option<String>,
    /// Statement sent to the backend.
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<Field>,
    /// Indices into `columns`.
    pub pk_columns: Vec<usize>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, columns: Vec<Field>, pk_columns: Vec<usize>) -> Self {
        TableInfo {
            name: name.into(),
            columns,
            pk_columns,
        }
    }

    pub fn pk_fields(&self) -> impl Iterator<Item = &Field> {
        self.pk_columns.iter().filter_map(|idx| self.columns.get(*idx))
    }
}

/// One unit yielded by a backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Fields(Vec<Field>),
    Rows(Vec<Row>),
}
