//! Deadline-bounded waiting for the freshly spawned core

use crate::error::{Result, ServiceError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of one readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Ready,
    /// Still waiting for the named condition
    Waiting(String),
    /// The process is gone, with its exit status if known
    Exited(String),
}

/// Poll `check` until it reports ready, the process exits, the deadline
/// passes or `cancel` fires. The last check runs at or after the deadline.
pub async fn wait_until_ready<F>(
    pid: u32,
    config: ReadinessConfig,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Check,
{
    let started = Instant::now();
    let deadline = started + config.timeout;

    loop {
        let waiting_for = match check() {
            Check::Ready => {
                debug!("pid {} ready after {:?}", pid, started.elapsed());
                return Ok(());
            }
            Check::Exited(status) => return Err(ServiceError::ProcessDied { pid, status }),
            Check::Waiting(what) => what,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(ServiceError::ReadinessTimeout {
                waited: now - started,
                waiting_for,
            });
        }

        let pause = config.interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
            _ = sleep(pause) => {}
        }
    }
}
