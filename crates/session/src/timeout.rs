//! Per-request deadline watchers.
//!
//! Each armed request gets a small tokio task that counts down in ticks.
//! On every tick the watcher first checks that its token is still current
//! and exits quietly if it is not (the request was answered, superseded or
//! cleared).  When the countdown reaches zero it tries to claim the token;
//! only a successful claim runs the expiry callback, so a request is
//! recovered by timeout at most once and never after its response won.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cl_protocol::RequestToken;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::correlator::RequestCorrelator;

/// Deadline bookkeeping for one request, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutRecord {
    /// Deadline the stage started with.
    pub original: u32,
    /// Deadline of the current attempt.
    pub current: u32,
    /// Ticks left before the current attempt expires.
    pub remaining: u32,
}

impl TimeoutRecord {
    pub fn new(ticks: u32) -> Self {
        Self {
            original: ticks,
            current: ticks,
            remaining: ticks,
        }
    }

    /// Next attempt with a grown deadline.
    pub fn grown(self, next: u32) -> Self {
        Self {
            original: self.original,
            current: next,
            remaining: next,
        }
    }

    /// Same deadline again, countdown restarted.
    pub fn restarted(self) -> Self {
        Self {
            remaining: self.current,
            ..self
        }
    }

    /// Whether the deadline already reached `multiplier` times the original.
    pub fn at_ceiling(&self, multiplier: u32) -> bool {
        self.current >= self.original.saturating_mul(multiplier)
    }
}

pub struct TimeoutSupervisor {
    correlator: Arc<RequestCorrelator>,
    tick: Duration,
    watchers: Arc<Mutex<HashMap<RequestToken, CancellationToken>>>,
}

impl TimeoutSupervisor {
    pub fn new(correlator: Arc<RequestCorrelator>, tick: Duration) -> Self {
        Self {
            correlator,
            tick,
            watchers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Start watching `token`.  `on_expire` runs at most once, and only
    /// if the watcher claims the token.
    pub fn arm<F>(&self, token: RequestToken, record: TimeoutRecord, on_expire: F)
    where
        F: FnOnce(RequestToken, TimeoutRecord) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.watchers.lock().insert(token, cancel.clone()) {
            previous.cancel();
        }

        let correlator = self.correlator.clone();
        let watchers = self.watchers.clone();
        let tick = self.tick;

        tokio::spawn(async move {
            let mut record = record;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }

                if !correlator.is_current(&token) {
                    tracing::trace!(token = %token, "watcher exiting, request settled");
                    break;
                }

                record.remaining = record.remaining.saturating_sub(1);
                if record.remaining == 0 {
                    if correlator.compare_and_clear(token, None) {
                        tracing::debug!(
                            token = %token,
                            current_ticks = record.current,
                            "request timed out"
                        );
                        watchers.lock().remove(&token);
                        on_expire(token, record);
                    }
                    break;
                }
            }
            watchers.lock().remove(&token);
        });
    }

    /// Stop watching `token`.  Returns whether a watcher was running.
    pub fn disarm(&self, token: &RequestToken) -> bool {
        match self.watchers.lock().remove(token) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&self) {
        let drained: Vec<_> = self.watchers.lock().drain().collect();
        for (_, cancel) in drained {
            cancel.cancel();
        }
    }

    pub fn armed(&self) -> usize {
        self.watchers.lock().len()
    }
}
