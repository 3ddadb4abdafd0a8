use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counters; cheap to bump from any thread.
#[derive(Debug, Default)]
pub(crate) struct MetricsInner {
    pub(crate) operations_completed: AtomicU64,
    pub(crate) operations_failed: AtomicU64,
    pub(crate) frames_committed: AtomicU64,
    pub(crate) bytes_written: AtomicU64,
    pub(crate) builder_rebuilds: AtomicU64,
}

impl MetricsInner {
    pub(crate) fn snapshot(&self) -> ProcessorMetrics {
        ProcessorMetrics {
            operations_completed: self.operations_completed.load(Ordering::Relaxed),
            operations_failed: self.operations_failed.load(Ordering::Relaxed),
            frames_committed: self.frames_committed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            builder_rebuilds: self.builder_rebuilds.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorMetrics {
    /// Operation futures completed successfully.
    pub operations_completed: u64,
    /// Operation futures completed with an error.
    pub operations_failed: u64,
    /// Frames durably acknowledged and applied.
    pub frames_committed: u64,
    /// Payload bytes durably written across committed frames.
    pub bytes_written: u64,
    /// Times the frame builder was rebuilt after a latched failure.
    pub builder_rebuilds: u64,
}
