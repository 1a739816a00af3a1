use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Process wide interrupt.
///
/// Cloned into every component that blocks on behalf of a request. Once
/// triggered, bounded waits end early and open streams stop.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the interrupt has been triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled either when the interrupt triggers or when cancelled
    /// directly.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// Trigger `interrupt` on ctrl-c.
pub fn spawn_signal_handler(interrupt: Interrupt) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received interrupt signal, cancelling blocked requests");
                interrupt.trigger();
            }
            Err(e) => error!(%e, "failed to listen for interrupt signal"),
        }
    })
}
