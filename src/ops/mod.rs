//! The operation model: the units of work admitted by the processor and the
//! binary records the frame builder serializes them into.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::{Result, StoreError};

/// Sequence number of an operation that has not been admitted yet.
/// Assigned sequence numbers start at 1.
pub const NO_SEQUENCE: u64 = 0;

const TAG_APPEND: u8 = 1;
const TAG_SEAL: u8 = 2;
const TAG_MAP: u8 = 3;
const TAG_MERGE: u8 = 4;
const TAG_CHECKPOINT: u8 = 5;

/// How an attribute update combines with the attribute's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeUpdateKind {
    /// Overwrite the current value.
    Replace,
    /// Add to the current value (missing attributes start at 0).
    Accumulate,
}

impl AttributeUpdateKind {
    fn tag(self) -> u8 {
        match self {
            AttributeUpdateKind::Replace => 0,
            AttributeUpdateKind::Accumulate => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(AttributeUpdateKind::Replace),
            1 => Ok(AttributeUpdateKind::Accumulate),
            _ => Err(StoreError::Corruption(format!(
                "unknown attribute update kind {tag}"
            ))),
        }
    }
}

/// A single numeric attribute mutation carried by an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeUpdate {
    /// Attribute identifier, scoped to the segment.
    pub id: u64,
    /// Combination rule.
    pub kind: AttributeUpdateKind,
    /// Operand value.
    pub value: i64,
}

/// Attribute updates attached to one operation. Almost always tiny.
pub type AttributeUpdates = SmallVec<[AttributeUpdate; 4]>;

/// Payload of an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum OperationBody {
    /// Append bytes at the tail of a segment.
    SegmentAppend {
        /// Target segment id.
        segment: u64,
        /// Write offset; assigned during pre-processing.
        offset: Option<u64>,
        /// The bytes to append.
        data: Bytes,
        /// Attribute mutations applied atomically with the append.
        attributes: AttributeUpdates,
    },
    /// Seal a segment against further appends.
    SegmentSeal {
        /// Target segment id.
        segment: u64,
        /// Final length; assigned during pre-processing.
        seal_offset: Option<u64>,
    },
    /// Map a segment into the container's catalog.
    SegmentMap {
        /// Segment id to register.
        segment: u64,
        /// Segment name; unique within the container.
        name: String,
        /// Initial length.
        length: u64,
        /// Whether the segment is already sealed.
        sealed: bool,
    },
    /// Merge a sealed source segment into the tail of a target segment.
    SegmentMerge {
        /// Segment receiving the bytes.
        target: u64,
        /// Sealed segment being folded in.
        source: u64,
        /// Merge offset within the target; assigned during pre-processing.
        offset: Option<u64>,
        /// Number of bytes merged; assigned during pre-processing.
        length: Option<u64>,
    },
    /// Durable marker that a metadata checkpoint was taken.
    MetadataCheckpoint,
    /// Metadata-only durability barrier; produces no frame record and
    /// completes once every earlier serializable operation is durable.
    Probe,
}

/// An ordered unit of work admitted through
/// [`OperationProcessor::process`](crate::OperationProcessor::process).
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    sequence: u64,
    body: OperationBody,
}

impl Operation {
    /// Append `data` at the tail of `segment`.
    pub fn append(segment: u64, data: Bytes) -> Self {
        Self::append_with_attributes(segment, data, AttributeUpdates::new())
    }

    /// Append with attached attribute updates.
    pub fn append_with_attributes(segment: u64, data: Bytes, attributes: AttributeUpdates) -> Self {
        Self {
            sequence: NO_SEQUENCE,
            body: OperationBody::SegmentAppend {
                segment,
                offset: None,
                data,
                attributes,
            },
        }
    }

    /// Seal `segment` against further appends.
    pub fn seal(segment: u64) -> Self {
        Self {
            sequence: NO_SEQUENCE,
            body: OperationBody::SegmentSeal {
                segment,
                seal_offset: None,
            },
        }
    }

    /// Map a new segment into the catalog.
    pub fn map(segment: u64, name: impl Into<String>, length: u64, sealed: bool) -> Self {
        Self {
            sequence: NO_SEQUENCE,
            body: OperationBody::SegmentMap {
                segment,
                name: name.into(),
                length,
                sealed,
            },
        }
    }

    /// Merge sealed segment `source` into `target`.
    pub fn merge(target: u64, source: u64) -> Self {
        Self {
            sequence: NO_SEQUENCE,
            body: OperationBody::SegmentMerge {
                target,
                source,
                offset: None,
                length: None,
            },
        }
    }

    /// Durable metadata-checkpoint marker.
    pub fn checkpoint() -> Self {
        Self {
            sequence: NO_SEQUENCE,
            body: OperationBody::MetadataCheckpoint,
        }
    }

    /// Durability barrier that serializes nothing.
    pub fn probe() -> Self {
        Self {
            sequence: NO_SEQUENCE,
            body: OperationBody::Probe,
        }
    }

    /// Whether this operation produces a frame record. Non-serializable
    /// operations never receive a sequence number and complete through the
    /// commit tracker's auto-completion path.
    pub fn can_serialize(&self) -> bool {
        !matches!(self.body, OperationBody::Probe)
    }

    /// Assigned sequence number, or [`NO_SEQUENCE`] before admission.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        debug_assert_eq!(self.sequence, NO_SEQUENCE, "sequence assigned twice");
        self.sequence = sequence;
    }

    /// The operation payload.
    pub fn body(&self) -> &OperationBody {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut OperationBody {
        &mut self.body
    }

    /// Serializes this operation into a frame record.
    ///
    /// Fails with [`StoreError::Serialization`] for non-serializable
    /// operations and for operations whose pre-processing has not assigned
    /// the derived fields yet.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_size_hint());
        match &self.body {
            OperationBody::SegmentAppend {
                segment,
                offset,
                data,
                attributes,
            } => {
                let offset = offset
                    .ok_or_else(|| StoreError::Serialization("append offset unassigned".into()))?;
                if data.len() > u32::MAX as usize {
                    return Err(StoreError::Serialization("append payload too large".into()));
                }
                if attributes.len() > u16::MAX as usize {
                    return Err(StoreError::Serialization("too many attribute updates".into()));
                }
                buf.put_u8(TAG_APPEND);
                buf.put_u64(self.sequence);
                buf.put_u64(*segment);
                buf.put_u64(offset);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
                buf.put_u16(attributes.len() as u16);
                for attr in attributes {
                    buf.put_u64(attr.id);
                    buf.put_u8(attr.kind.tag());
                    buf.put_i64(attr.value);
                }
            }
            OperationBody::SegmentSeal {
                segment,
                seal_offset,
            } => {
                let seal_offset = seal_offset
                    .ok_or_else(|| StoreError::Serialization("seal offset unassigned".into()))?;
                buf.put_u8(TAG_SEAL);
                buf.put_u64(self.sequence);
                buf.put_u64(*segment);
                buf.put_u64(seal_offset);
            }
            OperationBody::SegmentMap {
                segment,
                name,
                length,
                sealed,
            } => {
                if name.len() > u16::MAX as usize {
                    return Err(StoreError::Serialization("segment name too long".into()));
                }
                buf.put_u8(TAG_MAP);
                buf.put_u64(self.sequence);
                buf.put_u64(*segment);
                buf.put_u16(name.len() as u16);
                buf.put_slice(name.as_bytes());
                buf.put_u64(*length);
                buf.put_u8(u8::from(*sealed));
            }
            OperationBody::SegmentMerge {
                target,
                source,
                offset,
                length,
            } => {
                let offset = offset
                    .ok_or_else(|| StoreError::Serialization("merge offset unassigned".into()))?;
                let length = length
                    .ok_or_else(|| StoreError::Serialization("merge length unassigned".into()))?;
                buf.put_u8(TAG_MERGE);
                buf.put_u64(self.sequence);
                buf.put_u64(*target);
                buf.put_u64(*source);
                buf.put_u64(offset);
                buf.put_u64(length);
            }
            OperationBody::MetadataCheckpoint => {
                buf.put_u8(TAG_CHECKPOINT);
                buf.put_u64(self.sequence);
            }
            OperationBody::Probe => {
                return Err(StoreError::Serialization(
                    "probe operations are not serializable".into(),
                ));
            }
        }
        Ok(buf.freeze())
    }

    /// Decodes a frame record produced by [`Operation::encode`].
    pub fn decode(buf: &[u8]) -> Result<Operation> {
        let mut cursor = Cursor::new(buf);
        let tag = cursor.u8()?;
        let sequence = cursor.u64()?;
        let body = match tag {
            TAG_APPEND => {
                let segment = cursor.u64()?;
                let offset = cursor.u64()?;
                let data_len = cursor.u32()? as usize;
                let data = Bytes::copy_from_slice(cursor.bytes(data_len)?);
                let attr_count = cursor.u16()? as usize;
                let mut attributes = AttributeUpdates::new();
                for _ in 0..attr_count {
                    let id = cursor.u64()?;
                    let kind = AttributeUpdateKind::from_tag(cursor.u8()?)?;
                    let value = cursor.i64()?;
                    attributes.push(AttributeUpdate { id, kind, value });
                }
                OperationBody::SegmentAppend {
                    segment,
                    offset: Some(offset),
                    data,
                    attributes,
                }
            }
            TAG_SEAL => OperationBody::SegmentSeal {
                segment: cursor.u64()?,
                seal_offset: Some(cursor.u64()?),
            },
            TAG_MAP => {
                let segment = cursor.u64()?;
                let name_len = cursor.u16()? as usize;
                let name = std::str::from_utf8(cursor.bytes(name_len)?)
                    .map_err(|_| StoreError::Corruption("segment name is not utf-8".into()))?
                    .to_string();
                let length = cursor.u64()?;
                let sealed = cursor.u8()? != 0;
                OperationBody::SegmentMap {
                    segment,
                    name,
                    length,
                    sealed,
                }
            }
            TAG_MERGE => OperationBody::SegmentMerge {
                target: cursor.u64()?,
                source: cursor.u64()?,
                offset: Some(cursor.u64()?),
                length: Some(cursor.u64()?),
            },
            TAG_CHECKPOINT => OperationBody::MetadataCheckpoint,
            other => {
                return Err(StoreError::Corruption(format!(
                    "unknown operation record tag {other}"
                )))
            }
        };
        if !cursor.at_end() {
            return Err(StoreError::Corruption(
                "trailing bytes after operation record".into(),
            ));
        }
        Ok(Operation { sequence, body })
    }

    fn encoded_size_hint(&self) -> usize {
        match &self.body {
            OperationBody::SegmentAppend {
                data, attributes, ..
            } => 31 + data.len() + attributes.len() * 17,
            OperationBody::SegmentMap { name, .. } => 28 + name.len(),
            OperationBody::SegmentMerge { .. } => 41,
            _ => 25,
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| StoreError::Corruption("operation record truncated".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().expect("len 2")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().expect("len 4")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().expect("len 8")))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.bytes(8)?.try_into().expect("len 8")))
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}
