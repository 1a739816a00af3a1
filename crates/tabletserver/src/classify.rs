use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, warn};

use crate::errors::{ErrorKind, Result, fail};
use crate::stats::TabletStats;

/// Normalizes every outcome of a public operation into a [`TabletError`].
///
/// [`TabletError`]: crate::errors::TabletError
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    stats: Arc<TabletStats>,
}

impl ErrorClassifier {
    pub fn new(stats: Arc<TabletStats>) -> Self {
        ErrorClassifier { stats }
    }

    /// Run `fut`, converting a panic into a `Fail` error.
    pub async fn recover<T>(
        &self,
        context: &(dyn fmt::Display + Sync),
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                let backtrace = Backtrace::force_capture();
                self.stats.record_panic();
                error!(%context, %backtrace, "uncaught panic: {msg}");
                Err(fail!("{msg}: uncaught panic"))
            }
        }
    }

    /// Record and log an error, attaching the triggering context.
    pub fn classify<T>(&self, context: &(dyn fmt::Display + Sync), result: Result<T>) -> Result<T> {
        result.map_err(|err| {
            self.stats.record_error(err.kind());
            match err.kind() {
                // Expected under load.
                ErrorKind::Retry | ErrorKind::TxPoolFull => (),
                ErrorKind::Fail if err.is_dup_entry() => (),
                ErrorKind::Fatal => error!(%err, %context, "request failed"),
                ErrorKind::Fail => warn!(%err, %context, "request failed"),
            }
            err.with_context(context)
        })
    }

    /// Recover then classify.
    pub async fn handle<T>(
        &self,
        context: &(dyn fmt::Display + Sync),
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = self.recover(context, fut).await;
        self.classify(context, result)
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}
