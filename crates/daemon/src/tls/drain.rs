//! Handshake draining across configuration generations
//!
//! Every accepted connection handshakes against the configuration that was
//! live when it was accepted. After a swap, the previous generation is kept
//! until its in-flight handshakes finish or the drain timeout expires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counts in-flight handshakes for one configuration generation
#[derive(Debug, Clone, Default)]
pub struct HandshakeTracker {
    active: Arc<AtomicUsize>,
}

impl HandshakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a handshake as started; it ends when the guard drops
    pub fn begin(&self) -> HandshakeGuard {
        let count = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(active_handshakes = count, "Handshake started");
        HandshakeGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait for in-flight handshakes to finish
    ///
    /// Returns `true` if the generation drained within `max_drain_time`,
    /// `false` if handshakes were still running when it elapsed.
    pub async fn wait_for_drain(&self, generation: u64, max_drain_time: Duration) -> bool {
        let start = Instant::now();
        let initial = self.active_count();
        if initial == 0 {
            trace!(generation = generation, "Generation already drained");
            return true;
        }

        debug!(
            generation = generation,
            active_handshakes = initial,
            max_drain_time_secs = max_drain_time.as_secs(),
            "Draining previous TLS configuration"
        );

        let mut last_logged = initial;
        while self.active_count() > 0 {
            if start.elapsed() >= max_drain_time {
                warn!(
                    generation = generation,
                    remaining_handshakes = self.active_count(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Drain timeout reached, handshakes still in flight"
                );
                return false;
            }

            let current = self.active_count();
            if current != last_logged {
                trace!(generation = generation, remaining_handshakes = current, "Draining");
                last_logged = current;
            }

            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!(
            generation = generation,
            drained_handshakes = initial,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Previous TLS configuration drained"
        );
        true
    }
}

/// Ends one tracked handshake on drop
#[derive(Debug)]
pub struct HandshakeGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(active_handshakes = count, "Handshake finished");
    }
}
