use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::backend::{BackendHandle, Deadline, SchemaInfo};
use crate::errors::{Result, TabletError, fail};
use crate::types::{BindVars, BoundQuery, FieldType, QueryResult, QuerySplit, Value};

pub const SPLIT_START_BIND_VAR: &str = "_splitquery_start";
pub const SPLIT_END_BIND_VAR: &str = "_splitquery_end";

static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*select\s+(?P<exprs>.+?)\s+from\s+(?P<from>.+?)(?:\s+where\s+(?P<filter>.+?))?\s*;?\s*$",
    )
    .expect("select regex to be valid")
});

static UNSUPPORTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(distinct|group\s+by|having|order\s+by|limit|join|union|for\s+update|lock\s+in\s+share\s+mode)\b",
    )
    .expect("unsupported clause regex to be valid")
});

/// Quoted string literals, so clause keywords inside them are not mistaken
/// for clauses.
static LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^'\\]|\\.|'')*'|"(?:[^"\\]|\\.|"")*""#)
        .expect("literal regex to be valid")
});

static SUBQUERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*select\b").expect("subquery regex to be valid"));

static TABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^`?(?P<name>\w+)`?$").expect("table name regex to be valid"));

fn invalid(reason: impl fmt::Display) -> TabletError {
    fail!("query validation error: {reason}")
}

/// Splits a full table scan into queries over contiguous primary key ranges.
#[derive(Debug)]
pub struct QuerySplitter<'a> {
    query: &'a BoundQuery,
    split_count: usize,
    /// `select ... from table`, without the where clause.
    select_from: &'a str,
    filter: Option<&'a str>,
    table: String,
    pk_column: String,
}

impl<'a> QuerySplitter<'a> {
    /// Validate that `query` scans exactly one table with a single numeric
    /// primary key column.
    pub fn new(query: &'a BoundQuery, split_count: usize, schema: &dyn SchemaInfo) -> Result<Self> {
        if split_count == 0 {
            return Err(invalid("split count must be at least 1"));
        }

        let sql = query.sql.as_str();
        let caps = SELECT_RE
            .captures(sql)
            .ok_or_else(|| invalid("not a select statement with a from clause"))?;
        let unquoted = LITERAL_RE.replace_all(sql, "''");
        if let Some(m) = UNSUPPORTED_RE.find(&unquoted) {
            return Err(invalid(format!("unsupported clause: {}", m.as_str())));
        }
        if SUBQUERY_RE.is_match(&unquoted) {
            return Err(invalid("subqueries are not supported"));
        }

        let from = caps
            .name("from")
            .ok_or_else(|| invalid("missing from clause"))?;
        let table = TABLE_NAME_RE
            .captures(from.as_str().trim())
            .and_then(|c| c.name("name"))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| invalid(format!("unsupported table expression: {}", from.as_str())))?;

        let info = schema
            .table(&table)
            .ok_or_else(|| invalid(format!("can't find table in schema: {table}")))?;
        if info.pk_columns.len() != 1 {
            return Err(invalid(format!(
                "split query requires exactly one primary key column, table {table} has {}",
                info.pk_columns.len()
            )));
        }
        let pk = info
            .pk_fields()
            .next()
            .ok_or_else(|| invalid(format!("primary key column missing from table {table}")))?;
        if !matches!(
            pk.field_type,
            FieldType::Int | FieldType::UInt | FieldType::Float
        ) {
            return Err(invalid(format!(
                "unsupported primary key type {:?} for column {}",
                pk.field_type, pk.name
            )));
        }

        Ok(QuerySplitter {
            query,
            split_count,
            select_from: &sql[..from.end()],
            filter: caps.name("filter").map(|m| m.as_str()),
            table,
            pk_column: pk.name.clone(),
        })
    }

    pub fn split_count(&self) -> usize {
        self.split_count
    }

    /// Query returning the smallest and largest primary key values.
    pub fn min_max_sql(&self) -> String {
        format!(
            "SELECT MIN({pk}), MAX({pk}) FROM {table}",
            pk = self.pk_column,
            table = self.table
        )
    }

    /// The original query as the only split.
    pub fn unsplit(&self) -> Vec<QuerySplit> {
        vec![QuerySplit {
            query: self.query.clone(),
        }]
    }

    /// Build the splits given the result of [`Self::min_max_sql`].
    ///
    /// Splits are returned in ascending key order. An empty table, a single
    /// key, or a split count of one produce the original query.
    pub fn split(&self, min_max: &QueryResult) -> Result<Vec<QuerySplit>> {
        if self.split_count == 1 {
            return Ok(self.unsplit());
        }
        let (min, max) = match min_max.rows.first().map(|row| row.as_slice()) {
            Some([min, max]) => (min, max),
            _ => return Ok(self.unsplit()),
        };

        let boundaries: Vec<Value> = match (min, max) {
            (Value::Int(min), Value::Int(max)) => {
                int_boundaries(*min as i128, *max as i128, self.split_count)
                    .into_iter()
                    .map(|v| Value::Int(v as i64))
                    .collect()
            }
            (Value::UInt(min), Value::UInt(max)) => {
                int_boundaries(*min as i128, *max as i128, self.split_count)
                    .into_iter()
                    .map(|v| Value::UInt(v as u64))
                    .collect()
            }
            (Value::Float(min), Value::Float(max)) => {
                float_boundaries(*min, *max, self.split_count)
                    .into_iter()
                    .map(Value::Float)
                    .collect()
            }
            (min, max) if min.is_null() || max.is_null() => Vec::new(),
            (min, max) => {
                return Err(fail!(
                    "unsupported primary key bounds for {}: {min}, {max}",
                    self.pk_column
                ));
            }
        };

        if boundaries.len() < 2 {
            return Ok(self.unsplit());
        }

        let ranges = boundaries.len() - 1;
        let splits = boundaries
            .windows(2)
            .enumerate()
            .map(|(idx, bounds)| QuerySplit {
                query: self.range_query(&bounds[0], &bounds[1], idx == ranges - 1),
            })
            .collect();

        Ok(splits)
    }

    fn range_query(&self, start: &Value, end: &Value, last: bool) -> BoundQuery {
        let end_op = if last { "<=" } else { "<" };
        let pk = &self.pk_column;
        let range = format!(
            "{pk} >= :{SPLIT_START_BIND_VAR} AND {pk} {end_op} :{SPLIT_END_BIND_VAR}"
        );
        let sql = match self.filter {
            Some(filter) => format!("{} WHERE ({filter}) AND {range}", self.select_from),
            None => format!("{} WHERE {range}", self.select_from),
        };

        let mut bind_vars = self.query.bind_vars.clone();
        bind_vars.insert(SPLIT_START_BIND_VAR.to_string(), start.clone());
        bind_vars.insert(SPLIT_END_BIND_VAR.to_string(), end.clone());
        BoundQuery { sql, bind_vars }
    }
}

/// Boundaries of `[min, max]` split into at most `count` ranges.
///
/// Every range but the last spans the same number of keys, the last absorbs
/// the remainder. The final boundary is `max` itself.
fn int_boundaries(min: i128, max: i128, count: usize) -> Vec<i128> {
    if max <= min {
        return Vec::new();
    }
    let span = max - min + 1;
    let count = (count as i128).min(span);
    let width = span / count;

    let mut boundaries: Vec<i128> = (0..count).map(|idx| min + idx * width).collect();
    boundaries.push(max);
    boundaries
}

fn float_boundaries(min: f64, max: f64, count: usize) -> Vec<f64> {
    if !min.is_finite() || !max.is_finite() || max <= min {
        return Vec::new();
    }
    let width = (max - min) / count as f64;

    let mut boundaries: Vec<f64> = (0..count).map(|idx| min + idx as f64 * width).collect();
    boundaries.push(max);
    boundaries
}

/// Fetch the primary key bounds for a splitter.
pub(crate) async fn fetch_min_max(
    backend: &BackendHandle,
    splitter: &QuerySplitter<'_>,
    deadline: Deadline,
) -> Result<QueryResult> {
    let mut conn = backend.get_conn(deadline).await?;
    Ok(conn.exec(&splitter.min_max_sql(), &BindVars::new()).await?)
}
