//! Deciding when a metadata checkpoint should be synthesized.

use parking_lot::Mutex;
use tracing::debug;

/// Observes durably written bytes and decides when the container should
/// persist a metadata checkpoint.
///
/// `record_commit` is invoked on the commit path; implementations must not
/// block and must not re-enter the processor synchronously. The usual trigger
/// enqueues an [`Operation::checkpoint`](crate::Operation::checkpoint)
/// through [`OperationProcessor::process`](crate::OperationProcessor::process),
/// which only touches the intake queue.
pub trait CheckpointPolicy: Send + Sync {
    /// Notifies the policy that a frame of `bytes` was durably committed.
    fn record_commit(&self, bytes: u64);
}

/// Policy for containers that never checkpoint (tests, read-mostly tooling).
#[derive(Debug, Default)]
pub struct NoCheckpointPolicy;

impl CheckpointPolicy for NoCheckpointPolicy {
    fn record_commit(&self, _bytes: u64) {}
}

/// Fires its trigger once a threshold of bytes has been committed since the
/// last checkpoint.
pub struct ByteThresholdPolicy {
    threshold: u64,
    collected: Mutex<u64>,
    trigger: Box<dyn Fn() + Send + Sync>,
}

impl ByteThresholdPolicy {
    /// Fires `trigger` whenever `threshold` bytes accumulate.
    pub fn new(threshold: u64, trigger: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            threshold: threshold.max(1),
            collected: Mutex::new(0),
            trigger: Box::new(trigger),
        }
    }
}

impl CheckpointPolicy for ByteThresholdPolicy {
    fn record_commit(&self, bytes: u64) {
        let fire = {
            let mut collected = self.collected.lock();
            *collected += bytes;
            if *collected >= self.threshold {
                *collected = 0;
                true
            } else {
                false
            }
        };
        if fire {
            debug!(threshold = self.threshold, "checkpoint.policy.trigger");
            (self.trigger)();
        }
    }
}
