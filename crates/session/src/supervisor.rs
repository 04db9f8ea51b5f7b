//! Periodic token upkeep.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::machine::SessionEvent;

/// Spawn the ticker that asks the machine to check token expiry and
/// keep-alive every `every`.  The first tick fires one interval after
/// start.  Ends when `shutdown` is cancelled or the machine is gone.
pub(crate) fn spawn_refresh_ticker(
    every: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + every;
        let mut interval = tokio::time::interval_at(start, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if events.send(SessionEvent::RefreshTick).is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("refresh ticker stopped");
    })
}
