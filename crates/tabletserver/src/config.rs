use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, fatal};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TX_POOL_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the query service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletConfig {
    /// Upper bound for executing a single statement, commit, or rollback.
    ///
    /// Zero disables the deadline.
    pub query_timeout: Duration,
    /// How long `begin` may wait for a free transaction slot before failing
    /// with `TxPoolFull`.
    ///
    /// Zero disables the deadline.
    pub tx_pool_timeout: Duration,
}

impl Default for TabletConfig {
    fn default() -> Self {
        TabletConfig {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            tx_pool_timeout: DEFAULT_TX_POOL_TIMEOUT,
        }
    }
}

impl TabletConfig {
    /// Parse a config from json. Missing fields take their default values.
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| fatal!("invalid tablet config: {e}"))
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_tx_pool_timeout(mut self, timeout: Duration) -> Self {
        self.tx_pool_timeout = timeout;
        self
    }
}

/// Identity of the backend the service binds to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    pub keyspace: String,
    pub shard: String,
    #[serde(default)]
    pub dbname: String,
}

impl DbConfig {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        DbConfig {
            keyspace: keyspace.into(),
            shard: shard.into(),
            dbname: String::new(),
        }
    }
}

/// Overrides schema information the engine would otherwise load itself,
/// e.g. for views that don't declare a primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaOverride {
    pub name: String,
    #[serde(default)]
    pub pk_columns: Vec<String>,
}
