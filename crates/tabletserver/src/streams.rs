use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::interrupt::Interrupt;

/// Registry of in-progress streaming queries.
#[derive(Debug, Default)]
pub struct StreamQueryList {
    inner: Mutex<StreamQueryListInner>,
}

#[derive(Debug, Default)]
struct StreamQueryListInner {
    next_id: u64,
    streams: HashMap<u64, RegisteredStream>,
    /// Set between `terminate_all` and `reopen`. Streams registering in that
    /// window start out terminated.
    terminated: bool,
}

#[derive(Debug)]
struct RegisteredStream {
    sql: String,
    token: CancellationToken,
}

impl StreamQueryList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream. It's removed from the list when the returned
    /// registration is dropped.
    pub(crate) fn register(self: &Arc<Self>, sql: &str, interrupt: &Interrupt) -> StreamRegistration {
        let token = interrupt.child_token();
        let mut inner = self.inner.lock();
        if inner.terminated {
            token.cancel();
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.streams.insert(
            id,
            RegisteredStream {
                sql: sql.to_string(),
                token: token.clone(),
            },
        );

        StreamRegistration {
            list: self.clone(),
            id,
            token,
        }
    }

    /// Signal every registered stream to stop. Returns the number of streams
    /// signalled.
    pub fn terminate_all(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.terminated = true;
        for stream in inner.streams.values() {
            debug!(sql = %stream.sql, "terminating stream");
            stream.token.cancel();
        }
        inner.streams.len()
    }

    /// Accept streams again after a drain completes.
    pub(crate) fn reopen(&self) {
        self.inner.lock().terminated = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub(crate) struct StreamRegistration {
    list: Arc<StreamQueryList>,
    id: u64,
    token: CancellationToken,
}

impl StreamRegistration {
    /// Resolves once the stream has been asked to stop.
    pub(crate) async fn terminated(&self) {
        self.token.cancelled().await
    }
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.list.inner.lock().streams.remove(&self.id);
    }
}
