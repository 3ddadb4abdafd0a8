//! Applying durably committed operations to in-memory read state.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{Result, StoreError};
use crate::ops::{Operation, OperationBody};

/// Applies a durably committed operation to in-memory indices.
///
/// Called by the commit tracker, under its lock, in sequence-number order.
/// Implementations may only fail with
/// [`StoreError::Corruption`](crate::StoreError::Corruption): at this point
/// the operation is already durable, so any disagreement with in-memory state
/// is an invariant violation, not a recoverable condition.
pub trait MemoryStateUpdater: Send {
    /// Applies one committed operation.
    fn apply(&mut self, op: &Operation) -> Result<()>;

    /// Publishes updates batched since the last flush.
    fn flush(&mut self);
}

/// A no-op updater for containers without read-path caches.
#[derive(Debug, Default)]
pub struct NullStateUpdater;

impl MemoryStateUpdater for NullStateUpdater {
    fn apply(&mut self, _op: &Operation) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) {}
}

#[derive(Debug, Clone, Default)]
struct CachedSegment {
    name: String,
    length: u64,
    sealed: bool,
    /// Bytes appended since the segment was mapped. The prefix that existed
    /// before mapping is not cached.
    tail: Vec<u8>,
}

/// Published view of the committed read cache.
#[derive(Debug, Default)]
pub struct ReadCache {
    segments: FxHashMap<u64, CachedSegment>,
}

impl ReadCache {
    /// Committed length of a segment, if cached.
    pub fn length(&self, segment: u64) -> Option<u64> {
        self.segments.get(&segment).map(|s| s.length)
    }

    /// Whether a cached segment is sealed.
    pub fn is_sealed(&self, segment: u64) -> Option<bool> {
        self.segments.get(&segment).map(|s| s.sealed)
    }

    /// Bytes appended to the segment since it was mapped.
    pub fn tail_bytes(&self, segment: u64) -> Option<&[u8]> {
        self.segments.get(&segment).map(|s| s.tail.as_slice())
    }

    /// Name of a cached segment.
    pub fn name(&self, segment: u64) -> Option<&str> {
        self.segments.get(&segment).map(|s| s.name.as_str())
    }
}

/// [`MemoryStateUpdater`] maintaining a per-segment read cache.
///
/// `apply` stages mutations privately; `flush` publishes dirty segments into
/// the shared [`ReadCache`] handed out by [`cache`](Self::cache).
#[derive(Default)]
pub struct ReadCacheUpdater {
    segments: FxHashMap<u64, CachedSegment>,
    dirty: SmallVec<[u64; 16]>,
    published: Arc<Mutex<ReadCache>>,
}

impl ReadCacheUpdater {
    /// New updater with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the published cache.
    pub fn cache(&self) -> Arc<Mutex<ReadCache>> {
        Arc::clone(&self.published)
    }

    fn segment_mut(&mut self, id: u64) -> Result<&mut CachedSegment> {
        self.segments
            .get_mut(&id)
            .ok_or_else(|| StoreError::Corruption(format!("segment {id} missing from read cache")))
    }

    fn mark_dirty(&mut self, id: u64) {
        if !self.dirty.contains(&id) {
            self.dirty.push(id);
        }
    }
}

impl MemoryStateUpdater for ReadCacheUpdater {
    fn apply(&mut self, op: &Operation) -> Result<()> {
        match op.body() {
            OperationBody::SegmentAppend {
                segment,
                offset,
                data,
                ..
            } => {
                let offset = offset
                    .ok_or_else(|| StoreError::Corruption("committed append without offset".into()))?;
                let cached = self.segment_mut(*segment)?;
                if cached.sealed {
                    return Err(StoreError::Corruption(format!(
                        "committed append to sealed segment {segment}"
                    )));
                }
                if offset != cached.length {
                    return Err(StoreError::Corruption(format!(
                        "append offset {offset} does not continue segment {segment} at {}",
                        cached.length
                    )));
                }
                cached.length += data.len() as u64;
                cached.tail.extend_from_slice(data);
                self.mark_dirty(*segment);
            }
            OperationBody::SegmentSeal { segment, .. } => {
                let cached = self.segment_mut(*segment)?;
                cached.sealed = true;
                self.mark_dirty(*segment);
            }
            OperationBody::SegmentMap {
                segment,
                name,
                length,
                sealed,
            } => {
                if self.segments.contains_key(segment) {
                    return Err(StoreError::Corruption(format!(
                        "segment {segment} mapped twice"
                    )));
                }
                self.segments.insert(
                    *segment,
                    CachedSegment {
                        name: name.clone(),
                        length: *length,
                        sealed: *sealed,
                        tail: Vec::new(),
                    },
                );
                self.mark_dirty(*segment);
            }
            OperationBody::SegmentMerge {
                target,
                source,
                offset,
                length,
            } => {
                let (offset, length) = match (offset, length) {
                    (Some(offset), Some(length)) => (*offset, *length),
                    _ => {
                        return Err(StoreError::Corruption(
                            "committed merge without derived fields".into(),
                        ))
                    }
                };
                let source_tail = {
                    let source_cached = self.segment_mut(*source)?;
                    if !source_cached.sealed {
                        return Err(StoreError::Corruption(format!(
                            "committed merge of unsealed segment {source}"
                        )));
                    }
                    std::mem::take(&mut source_cached.tail)
                };
                self.segments.remove(source);
                let target_cached = self.segment_mut(*target)?;
                if offset != target_cached.length {
                    return Err(StoreError::Corruption(format!(
                        "merge offset {offset} does not continue segment {target} at {}",
                        target_cached.length
                    )));
                }
                target_cached.length = offset + length;
                target_cached.tail.extend_from_slice(&source_tail);
                self.mark_dirty(*target);
                self.mark_dirty(*source);
            }
            OperationBody::MetadataCheckpoint | OperationBody::Probe => {}
        }
        Ok(())
    }

    fn flush(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let mut published = self.published.lock();
        for id in self.dirty.drain(..) {
            match self.segments.get(&id) {
                Some(segment) => {
                    published.segments.insert(id, segment.clone());
                }
                None => {
                    published.segments.remove(&id);
                }
            }
        }
    }
}
