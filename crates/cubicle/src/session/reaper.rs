//! Background sweep for idle and expired sessions

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::session::{Expiry, SessionRegistry, SessionState};

/// Periodically stops sessions past the idle threshold or the lifetime cap
#[derive(Debug, Clone)]
pub struct Reaper {
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    max_lifetime: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<SessionRegistry>, config: &SessionConfig) -> Self {
        Self {
            registry,
            idle_timeout: config.idle_timeout(),
            max_lifetime: config.max_lifetime(),
            interval: config.reaper_interval(),
        }
    }

    /// Run one sweep; returns the number of sessions reaped
    pub async fn reap_once(&self) -> usize {
        let expired = self
            .registry
            .sweep(Instant::now(), self.idle_timeout, self.max_lifetime);
        let count = expired.len();
        for (session, expiry) in expired {
            let reason = match expiry {
                Expiry::Idle => "idle timeout",
                Expiry::Lifetime => "lifetime cap",
            };
            info!(session = %session.id(), reason, "reaping session");
            session.close(SessionState::Stopped).await;
        }
        count
    }

    /// Sweep on a fixed interval until `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = self.reap_once().await;
                        debug!(reaped, live = self.registry.len(), "reaper sweep");
                    }
                }
            }
        })
    }
}
