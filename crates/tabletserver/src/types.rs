use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Activation token issued each time the service starts serving.
pub type SessionId = i64;

/// Transaction id issued by the transaction pool. Zero means no transaction.
pub type TxId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

pub type BindVars = HashMap<String, Value>;

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int,
    UInt,
    Float,
    Decimal,
    Text,
    Bytes,
    Datetime,
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Field {
            name: name.into(),
            field_type,
        }
    }
}

/// Result of a single statement, or one unit of a streamed result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows_affected: u64,
    pub insert_id: u64,
    pub rows: Vec<Row>,
}

impl QueryResult {
    /// Result carrying only rows, as sent after the first unit of a stream.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        QueryResult {
            rows_affected: rows.len() as u64,
            rows,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.rows.is_empty() && self.rows_affected == 0
    }
}

/// A statement and its bind variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundQuery {
    pub sql: String,
    #[serde(default)]
    pub bind_vars: BindVars,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        BoundQuery {
            sql: sql.into(),
            bind_vars: BindVars::new(),
        }
    }

    pub fn with_bind_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind_vars.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for BoundQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sql: {:?}, BindVars: {{", self.sql)?;
        // Sorted so the output is stable.
        let mut names: Vec<_> = self.bind_vars.keys().collect();
        names.sort();
        for (idx, name) in names.into_iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {}", self.bind_vars[name])?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub sql: String,
    /// Missing bind variables are treated as an empty map.
    pub bind_vars: Option<BindVars>,
    pub transaction_id: TxId,
    pub session_id: SessionId,
}

impl Query {
    pub fn new(session_id: SessionId, sql: impl Into<String>) -> Self {
        Query {
            sql: sql.into(),
            bind_vars: None,
            transaction_id: 0,
            session_id,
        }
    }

    pub fn in_transaction(mut self, tx_id: TxId) -> Self {
        self.transaction_id = tx_id;
        self
    }

    pub fn with_bind_vars(mut self, bind_vars: BindVars) -> Self {
        self.bind_vars = Some(bind_vars);
        self
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sql: {:?}", self.sql)?;
        if self.transaction_id != 0 {
            write!(f, ", TransactionId: {}", self.transaction_id)?;
        }
        Ok(())
    }
}

/// Statements executed in order within one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryList {
    pub queries: Vec<BoundQuery>,
    pub session_id: SessionId,
    /// Transaction carried in from an earlier request, or zero.
    pub transaction_id: TxId,
}

impl QueryList {
    pub fn new<I, S>(session_id: SessionId, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        QueryList {
            queries: statements.into_iter().map(BoundQuery::new).collect(),
            session_id,
            transaction_id: 0,
        }
    }
}

impl fmt::Display for QueryList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Batch: [")?;
        for (idx, query) in self.queries.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", query.sql)?;
        }
        write!(f, "]")?;
        if self.transaction_id != 0 {
            write!(f, ", TransactionId: {}", self.transaction_id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub keyspace: String,
    pub shard: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitQueryRequest {
    pub query: BoundQuery,
    pub split_count: usize,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySplit {
    pub query: BoundQuery,
}
