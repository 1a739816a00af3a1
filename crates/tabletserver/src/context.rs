use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::admission::RequestAdmission;
use crate::backend::Deadline;
use crate::classify::ErrorClassifier;
use crate::config::TabletConfig;
use crate::errors::{Result, TabletError, retry};
use crate::interrupt::Interrupt;
use crate::stats::TabletStats;
use crate::streams::StreamQueryList;

/// State shared by every component serving requests.
///
/// Owned by the service instead of living in globals, so independent services
/// can run side by side in one process.
#[derive(Debug, Clone)]
pub struct TabletContext {
    pub admission: Arc<RequestAdmission>,
    pub config: TabletConfig,
    pub stats: Arc<TabletStats>,
    pub classifier: ErrorClassifier,
    pub streams: Arc<StreamQueryList>,
    pub interrupt: Interrupt,
}

impl TabletContext {
    pub fn new(config: TabletConfig, interrupt: Interrupt) -> Self {
        let stats = Arc::new(TabletStats::new());
        TabletContext {
            admission: Arc::new(RequestAdmission::new()),
            config,
            classifier: ErrorClassifier::new(stats.clone()),
            stats,
            streams: Arc::new(StreamQueryList::new()),
            interrupt,
        }
    }

    /// Deadline `timeout` from now. A zero timeout means no deadline.
    pub fn deadline_after(timeout: Duration) -> Deadline {
        if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        }
    }

    pub fn query_deadline(&self) -> Deadline {
        Self::deadline_after(self.config.query_timeout)
    }

    /// Run `fut` until it completes, the deadline passes, or the process is
    /// interrupted.
    ///
    /// Dropping `fut` on timeout drops anything it has checked out, returning
    /// connections to their pool.
    pub async fn bounded<T>(
        &self,
        deadline: Deadline,
        fut: impl Future<Output = Result<T>>,
        on_timeout: impl FnOnce() -> TabletError,
    ) -> Result<T> {
        let timed = async move {
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(on_timeout()),
                },
                None => fut.await,
            }
        };

        tokio::select! {
            result = timed => result,
            _ = self.interrupt.triggered() => Err(retry!("interrupted")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, fail};

    fn context() -> TabletContext {
        TabletContext::new(TabletConfig::default(), Interrupt::new())
    }

    #[test]
    fn zero_timeout_has_no_deadline() {
        assert_eq!(None, TabletContext::deadline_after(Duration::ZERO));
        assert!(TabletContext::deadline_after(Duration::from_secs(1)).is_some());
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let ctx = context();
        let deadline = TabletContext::deadline_after(Duration::from_millis(10));
        let err = ctx
            .bounded(
                deadline,
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                },
                || fail!("timed out"),
            )
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Fail, err.kind());
    }

    #[tokio::test]
    async fn bounded_interrupted() {
        let ctx = context();
        ctx.interrupt.trigger();
        let err = ctx
            .bounded(
                None,
                futures::future::pending::<Result<()>>(),
                || fail!("timed out"),
            )
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Retry, err.kind());
    }

    #[tokio::test]
    async fn bounded_completes() {
        let ctx = context();
        let v = ctx
            .bounded(ctx.query_deadline(), async { Ok(3) }, || fail!("timed out"))
            .await
            .unwrap();
        assert_eq!(3, v);
    }
}
