//! Per-client trailing window rate limiter.
//!
//! Each client owns a [`ClientWindow`] of admitted request instants. The
//! prune, check and record steps run while holding the dashmap entry guard,
//! so concurrent requests from one client are serialised on that entry while
//! different clients proceed on other shards.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use dashmap::DashMap;

/// Admitted request instants for one client, oldest first.
#[derive(Debug, Default)]
pub struct ClientWindow {
    admitted: VecDeque<Instant>,
}

impl ClientWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.admitted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.admitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

pub struct RateLimiter {
    clients: DashMap<String, ClientWindow, RandomState>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            clients: DashMap::with_hasher(RandomState::new()),
            max_requests,
            window,
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Admit or reject a request from `client_id`. Admission consumes a slot.
    pub fn admit(&self, client_id: &str) -> bool {
        self.try_admit_at(client_id, Instant::now()).is_ok()
    }

    /// Like [`admit`](Self::admit) but reports how long until the oldest
    /// admitted request leaves the window when rejecting.
    pub fn try_admit(&self, client_id: &str) -> Result<(), Duration> {
        self.try_admit_at(client_id, Instant::now())
    }

    pub(crate) fn try_admit_at(&self, client_id: &str, now: Instant) -> Result<(), Duration> {
        let mut entry = self.clients.entry(client_id.to_owned()).or_default();
        entry.prune(now, self.window);
        if entry.len() >= self.max_requests {
            let retry_after = entry
                .admitted
                .front()
                .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }
        entry.admitted.push_back(now);
        Ok(())
    }

    /// Drop every client whose window has fully expired. Returns the number
    /// of entries removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let before = self.clients.len();
        let window = self.window;
        self.clients.retain(|_, w| {
            w.prune(now, window);
            !w.is_empty()
        });
        before.saturating_sub(self.clients.len())
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Spawn a background task sweeping stale clients every `every`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::debug!(
                        removed,
                        remaining = limiter.tracked_clients(),
                        "swept idle rate limit windows"
                    );
                }
            }
        })
    }
}
