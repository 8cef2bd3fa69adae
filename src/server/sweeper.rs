use crate::application_port::AuthError;
use crate::domain_model::Clock;
use crate::domain_port::RefreshSessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Deletes dead refresh sessions on a fixed interval until cancelled.
pub struct ExpirySweeper {
    session_store: Arc<dyn RefreshSessionStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl ExpirySweeper {
    pub fn new(
        session_store: Arc<dyn RefreshSessionStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            session_store,
            clock,
            interval,
            cancellation_token,
        }
    }

    pub async fn sweep_once(&self) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let purged = self.session_store.purge_expired(now).await?;
        if purged > 0 {
            tracing::info!(count = purged, "purged refresh sessions");
        } else {
            tracing::debug!("nothing to purge");
        }
        Ok(purged)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("sweeper shutting down...");
                    break;
                }
                _ = ticker.tick() => {
                    // a failed tick is retried on the next one
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "sweep failed");
                    }
                }
            }
        }
        Ok(())
    }
}
