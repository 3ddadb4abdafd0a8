use std::time::Duration;

/// Tuning knobs for an [`OperationProcessor`](crate::OperationProcessor).
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Maximum number of frame writes in flight against the durable log.
    pub max_concurrent_writes: usize,
    /// Maximum number of operations pulled from the intake queue per loop
    /// iteration.
    pub max_read_at_once: usize,
    /// How long `stop` waits for in-flight frame writes to drain before
    /// failing the remaining operations.
    pub shutdown_timeout: Duration,
    /// Capacity of a data frame in bytes. An operation larger than this spans
    /// consecutive frames.
    pub frame_capacity: usize,
    /// Bound on the intake queue. `None` leaves admission control entirely to
    /// the caller; `Some(n)` makes `process` fail fast with `QueueFull`.
    pub intake_capacity: Option<usize>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_writes: 1,
            max_read_at_once: 1000,
            shutdown_timeout: Duration::from_secs(10),
            frame_capacity: 1024 * 1024,
            intake_capacity: None,
        }
    }
}

impl ProcessorConfig {
    /// Conservative settings: one write in flight, smaller frames, so every
    /// durable acknowledgment covers a short window of operations.
    pub fn durable() -> Self {
        Self {
            max_concurrent_writes: 1,
            max_read_at_once: 256,
            shutdown_timeout: Duration::from_secs(10),
            frame_capacity: 128 * 1024,
            intake_capacity: Some(4096),
        }
    }

    /// Deep write pipeline and large frames for throughput-bound containers.
    pub fn high_throughput() -> Self {
        Self {
            max_concurrent_writes: 8,
            max_read_at_once: 1000,
            shutdown_timeout: Duration::from_secs(30),
            frame_capacity: 4 * 1024 * 1024,
            intake_capacity: None,
        }
    }
}
