//! Timeout scheduling for the consensus core.
//!
//! One logical timer is armed at a time, tagged with a monotonic
//! generation counter. Arming a new timeout supersedes the previous one:
//! a superseded timer's task still wakes up, sees a newer generation, and
//! drops its delivery. The state machine additionally discards any
//! delivered timeout whose (height, round, step) is stale, so late
//! deliveries are harmless either way.

use crate::types::Step;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A fired (or pending) timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutInfo {
    /// How long the timer was armed for
    pub duration: Duration,
    /// Height the timer was armed at
    pub block_number: u64,
    /// Round the timer was armed at
    pub round: i64,
    /// Step the timer was armed for
    pub step: Step,
}

/// Schedules consensus timeouts and delivers expirations on a channel.
pub struct TimeoutScheduler {
    tx: mpsc::Sender<TimeoutInfo>,
    generation: Arc<AtomicU64>,
}

impl TimeoutScheduler {
    /// Create a scheduler and the receiving half of its delivery channel.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx,
                generation: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Arm a timeout. Any previously armed timeout is superseded.
    pub fn schedule(&self, info: TimeoutInfo) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        debug!(
            block_number = info.block_number,
            round = info.round,
            step = %info.step,
            duration_ms = info.duration.as_millis() as u64,
            "scheduling timeout"
        );

        let tx = self.tx.clone();
        let latest = self.generation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(info.duration).await;

            if latest.load(Ordering::SeqCst) != generation {
                trace!(
                    block_number = info.block_number,
                    round = info.round,
                    step = %info.step,
                    "dropping superseded timeout"
                );
                return;
            }

            // Receiver gone means the core stopped
            let _ = tx.send(info).await;
        });
    }
}
