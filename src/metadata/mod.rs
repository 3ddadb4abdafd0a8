//! The container's mutable segment catalog and the layered update
//! transactions the processor stages speculative mutations in.

mod updater;

pub use updater::{MetadataUpdater, TxnId};

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::log::LogAddress;

/// Catalog entry for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMetadata {
    /// Segment name; unique within the container.
    pub name: String,
    /// Length of the segment's durably committed data.
    pub length: u64,
    /// Whether the segment rejects further appends.
    pub sealed: bool,
    /// Whether the segment has been merged into another and ceased to exist.
    pub merged: bool,
    /// Numeric attributes.
    pub attributes: FxHashMap<u64, i64>,
}

impl SegmentMetadata {
    /// New unsealed segment with the given name and length.
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            length,
            sealed: false,
            merged: false,
            attributes: FxHashMap::default(),
        }
    }
}

/// The base (committed) metadata of one segment container.
///
/// `PartialEq` compares the full observable state, which is what the
/// rollback and replay-equivalence laws assert on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerMetadata {
    segments: FxHashMap<u64, SegmentMetadata>,
    by_name: FxHashMap<String, u64>,
    // Keyed by operation sequence number: "the log up to `address` covers
    // every operation with sequence number <= key". Frame acknowledgments may
    // arrive out of order, so this cannot be an append-only list.
    truncation_markers: BTreeMap<u64, LogAddress>,
}

impl ContainerMetadata {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a segment by id.
    pub fn segment(&self, id: u64) -> Option<&SegmentMetadata> {
        self.segments.get(&id)
    }

    /// Looks up a segment id by name.
    pub fn segment_id_by_name(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Number of mapped segments, merged ones included.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Recorded truncation markers in sequence-number order:
    /// `(up_to_sequence, covering log address)` pairs.
    pub fn truncation_markers(&self) -> impl Iterator<Item = (u64, LogAddress)> + '_ {
        self.truncation_markers.iter().map(|(seq, addr)| (*seq, *addr))
    }

    pub(crate) fn insert_segment(&mut self, id: u64, meta: SegmentMetadata) {
        self.by_name.insert(meta.name.clone(), id);
        self.segments.insert(id, meta);
    }

    pub(crate) fn segment_mut(&mut self, id: u64) -> Option<&mut SegmentMetadata> {
        self.segments.get_mut(&id)
    }

    /// Records a truncation marker. Idempotent for repeated acknowledgments
    /// of the same frame.
    pub(crate) fn record_truncation_marker(&mut self, up_to_sequence: u64, address: LogAddress) {
        self.truncation_markers.insert(up_to_sequence, address);
    }
}
