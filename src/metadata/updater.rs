//! Staging layer between the processor and the container's base metadata.
//!
//! Mutations from operations that are not yet durable live in update
//! transactions: delta layers stacked on top of the base catalog. Sealing a
//! frame seals the current layer; a durable acknowledgment merges layers into
//! the base, a write failure discards them. The base is never touched by an
//! operation that did not make it to the log.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::log::LogAddress;
use crate::metadata::{ContainerMetadata, SegmentMetadata};
use crate::ops::{AttributeUpdateKind, Operation, OperationBody};

/// Identifier of an update transaction. Dense and monotonically increasing,
/// starting at 0; never reused, not even after a rollback.
pub type TxnId = u64;

#[derive(Debug, Default, Clone)]
struct SegmentDelta {
    created: Option<SegmentMetadata>,
    length: Option<u64>,
    sealed: Option<bool>,
    merged: Option<bool>,
    attributes: FxHashMap<u64, i64>,
}

#[derive(Debug, Default)]
struct TxnLayer {
    deltas: FxHashMap<u64, SegmentDelta>,
    names: FxHashMap<String, u64>,
}

#[derive(Debug)]
struct SealedTxn {
    id: TxnId,
    layer: TxnLayer,
}

#[derive(Debug, Clone, Copy)]
struct SegmentView {
    length: u64,
    sealed: bool,
    merged: bool,
}

/// Validates and stages operations against the container metadata.
///
/// All methods must be called under the processor's shared state lock.
#[derive(Debug)]
pub struct MetadataUpdater {
    base: ContainerMetadata,
    sealed: VecDeque<SealedTxn>,
    open: Option<TxnLayer>,
    next_txn_id: TxnId,
    next_sequence: u64,
}

impl MetadataUpdater {
    /// Wraps the given base metadata. Sequence numbers continue from
    /// `first_sequence` (1 for a brand-new container).
    pub fn new(base: ContainerMetadata, first_sequence: u64) -> Self {
        Self {
            base,
            sealed: VecDeque::new(),
            open: None,
            next_txn_id: 0,
            next_sequence: first_sequence.max(1),
        }
    }

    /// The committed metadata, with no speculative layers applied.
    pub fn base(&self) -> &ContainerMetadata {
        &self.base
    }

    /// Hands out the next operation sequence number. Strictly increasing for
    /// the lifetime of the updater; rollbacks do not reclaim numbers.
    pub fn next_operation_sequence_number(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Validates `op` against the current (layered) view and assigns its
    /// derived fields: append/merge offsets, seal length.
    ///
    /// Fails with [`StoreError::BadOperation`] on logical rejection. Must be
    /// followed by [`accept`](Self::accept) once the operation has been
    /// handed to the frame builder.
    pub fn pre_process(&mut self, op: &mut Operation) -> Result<()> {
        match op.body_mut() {
            OperationBody::SegmentAppend {
                segment, offset, ..
            } => {
                let view = self.require_live_segment(*segment)?;
                if view.sealed {
                    return Err(StoreError::BadOperation(format!(
                        "append to sealed segment {segment}"
                    )));
                }
                if let Some(requested) = *offset {
                    if requested != view.length {
                        return Err(StoreError::BadOperation(format!(
                            "append offset {requested} does not match segment {segment} length {}",
                            view.length
                        )));
                    }
                }
                *offset = Some(view.length);
            }
            OperationBody::SegmentSeal {
                segment,
                seal_offset,
            } => {
                let view = self.require_live_segment(*segment)?;
                if view.sealed {
                    return Err(StoreError::BadOperation(format!(
                        "segment {segment} is already sealed"
                    )));
                }
                *seal_offset = Some(view.length);
            }
            OperationBody::SegmentMap { segment, name, .. } => {
                if self.segment_view(*segment).is_some() {
                    return Err(StoreError::BadOperation(format!(
                        "segment id {segment} is already mapped"
                    )));
                }
                if self.name_in_use(name) {
                    return Err(StoreError::BadOperation(format!(
                        "segment name {name:?} is already mapped"
                    )));
                }
            }
            OperationBody::SegmentMerge {
                target,
                source,
                offset,
                length,
            } => {
                let (target, source) = (*target, *source);
                let target_view = self.require_live_segment(target)?;
                if target_view.sealed {
                    return Err(StoreError::BadOperation(format!(
                        "merge into sealed segment {target}"
                    )));
                }
                let source_view = self.require_live_segment(source)?;
                if !source_view.sealed {
                    return Err(StoreError::BadOperation(format!(
                        "merge source {source} is not sealed"
                    )));
                }
                *offset = Some(target_view.length);
                *length = Some(source_view.length);
            }
            OperationBody::MetadataCheckpoint | OperationBody::Probe => {}
        }
        Ok(())
    }

    /// Applies `op`'s mutation to the open transaction. Pairs with
    /// [`pre_process`](Self::pre_process); expects the derived fields that
    /// pre-processing assigned.
    pub fn accept(&mut self, op: &Operation) -> Result<()> {
        match op.body() {
            OperationBody::SegmentAppend {
                segment,
                offset,
                data,
                attributes,
            } => {
                let offset = offset.ok_or_else(|| {
                    StoreError::Corruption("append accepted without pre-processing".into())
                })?;
                let new_length = offset + data.len() as u64;
                let resolved: Vec<(u64, i64)> = attributes
                    .iter()
                    .map(|update| {
                        let value = match update.kind {
                            AttributeUpdateKind::Replace => update.value,
                            AttributeUpdateKind::Accumulate => {
                                self.attribute_view(*segment, update.id) + update.value
                            }
                        };
                        (update.id, value)
                    })
                    .collect();
                let delta = self.open_delta(*segment);
                delta.length = Some(new_length);
                for (id, value) in resolved {
                    delta.attributes.insert(id, value);
                }
            }
            OperationBody::SegmentSeal {
                segment,
                seal_offset,
            } => {
                if seal_offset.is_none() {
                    return Err(StoreError::Corruption(
                        "seal accepted without pre-processing".into(),
                    ));
                }
                self.open_delta(*segment).sealed = Some(true);
            }
            OperationBody::SegmentMap {
                segment,
                name,
                length,
                sealed,
            } => {
                let mut meta = SegmentMetadata::new(name.clone(), *length);
                meta.sealed = *sealed;
                let (segment, name) = (*segment, name.clone());
                self.open_delta(segment).created = Some(meta);
                self.open_layer().names.insert(name, segment);
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
                            "merge accepted without pre-processing".into(),
                        ))
                    }
                };
                self.open_delta(*target).length = Some(offset + length);
                self.open_delta(*source).merged = Some(true);
            }
            OperationBody::MetadataCheckpoint | OperationBody::Probe => {}
        }
        Ok(())
    }

    /// Seals the current open transaction (creating an empty one if none) and
    /// returns its id. A fresh open transaction implicitly starts on the next
    /// mutation.
    pub fn seal_transaction(&mut self) -> TxnId {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        let layer = self.open.take().unwrap_or_default();
        debug!(txn_id = id, deltas = layer.deltas.len(), "metadata.txn.seal");
        self.sealed.push_back(SealedTxn { id, layer });
        id
    }

    /// Merges every sealed transaction with id at most `up_to` into the base
    /// metadata, in id order.
    pub fn commit(&mut self, up_to: TxnId) {
        while self
            .sealed
            .front()
            .map(|txn| txn.id <= up_to)
            .unwrap_or(false)
        {
            let txn = self.sealed.pop_front().expect("checked front");
            debug!(txn_id = txn.id, "metadata.txn.commit");
            for (segment, delta) in txn.layer.deltas {
                apply_delta(&mut self.base, segment, delta);
            }
        }
    }

    /// Discards every transaction with id at least `from`, the open one
    /// included. The base metadata is untouched.
    pub fn rollback(&mut self, from: TxnId) {
        let dropped_open = self.open.take().is_some();
        let mut dropped = 0usize;
        while self
            .sealed
            .back()
            .map(|txn| txn.id >= from)
            .unwrap_or(false)
        {
            self.sealed.pop_back();
            dropped += 1;
        }
        debug!(from_txn_id = from, dropped, dropped_open, "metadata.txn.rollback");
    }

    /// Records a durable truncation point directly on the base metadata.
    pub fn record_truncation_marker(&mut self, up_to_sequence: u64, address: LogAddress) {
        self.base.record_truncation_marker(up_to_sequence, address);
    }

    fn require_live_segment(&self, segment: u64) -> Result<SegmentView> {
        let view = self.segment_view(segment).ok_or_else(|| {
            StoreError::BadOperation(format!("segment {segment} is not mapped"))
        })?;
        if view.merged {
            return Err(StoreError::BadOperation(format!(
                "segment {segment} has been merged away"
            )));
        }
        Ok(view)
    }

    fn segment_view(&self, segment: u64) -> Option<SegmentView> {
        // Newest layer wins per field: open, then sealed (newest first), then
        // the base catalog. A creating delta terminates the walk.
        let mut created: Option<SegmentView> = None;
        let mut length = None;
        let mut sealed = None;
        let mut merged = None;
        for layer in self
            .open
            .iter()
            .chain(self.sealed.iter().rev().map(|txn| &txn.layer))
        {
            if let Some(delta) = layer.deltas.get(&segment) {
                length = length.or(delta.length);
                sealed = sealed.or(delta.sealed);
                merged = merged.or(delta.merged);
                if let Some(meta) = &delta.created {
                    created = Some(SegmentView {
                        length: meta.length,
                        sealed: meta.sealed,
                        merged: meta.merged,
                    });
                    break;
                }
            }
        }
        let base_view = self.base.segment(segment).map(|meta| SegmentView {
            length: meta.length,
            sealed: meta.sealed,
            merged: meta.merged,
        });
        let bottom = created.or(base_view)?;
        Some(SegmentView {
            length: length.unwrap_or(bottom.length),
            sealed: sealed.unwrap_or(bottom.sealed),
            merged: merged.unwrap_or(bottom.merged),
        })
    }

    fn attribute_view(&self, segment: u64, attribute: u64) -> i64 {
        for layer in self
            .open
            .iter()
            .chain(self.sealed.iter().rev().map(|txn| &txn.layer))
        {
            if let Some(delta) = layer.deltas.get(&segment) {
                if let Some(value) = delta.attributes.get(&attribute) {
                    return *value;
                }
                if let Some(created) = &delta.created {
                    return created.attributes.get(&attribute).copied().unwrap_or(0);
                }
            }
        }
        self.base
            .segment(segment)
            .and_then(|meta| meta.attributes.get(&attribute).copied())
            .unwrap_or(0)
    }

    fn name_in_use(&self, name: &str) -> bool {
        if self.base.segment_id_by_name(name).is_some() {
            return true;
        }
        self.open
            .iter()
            .chain(self.sealed.iter().map(|txn| &txn.layer))
            .any(|layer| layer.names.contains_key(name))
    }

    fn open_layer(&mut self) -> &mut TxnLayer {
        self.open.get_or_insert_with(TxnLayer::default)
    }

    fn open_delta(&mut self, segment: u64) -> &mut SegmentDelta {
        self.open_layer().deltas.entry(segment).or_default()
    }
}

fn apply_delta(base: &mut ContainerMetadata, segment: u64, delta: SegmentDelta) {
    if let Some(created) = delta.created {
        base.insert_segment(segment, created);
    }
    if let Some(meta) = base.segment_mut(segment) {
        if let Some(length) = delta.length {
            meta.length = length;
        }
        if let Some(sealed) = delta.sealed {
            meta.sealed = sealed;
        }
        if let Some(merged) = delta.merged {
            meta.merged = merged;
        }
        for (id, value) in delta.attributes {
            meta.attributes.insert(id, value);
        }
    }
}
