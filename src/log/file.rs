//! Single-file durable log for single-node deployments.
//!
//! Layout: a fixed header identifying the file, followed by length-prefixed
//! records, each with a CRC-protected record header and a CRC over the
//! payload. The writer is strictly append-only; reopening scans the existing
//! records to find the tail.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::log::{AppendFuture, DurableLog, LogAddress};

const FILE_MAGIC: [u8; 4] = *b"SGLG";
const FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 24;

struct Inner {
    file: File,
    next_sequence: u64,
    offset: u64,
    closed: bool,
}

/// See the [module docs](self).
pub struct FileLog {
    inner: Arc<Mutex<Inner>>,
    sync_on_append: bool,
}

impl FileLog {
    /// Opens or creates the log at `path`. `sync_on_append` trades latency
    /// for per-record durability.
    pub fn open(path: impl AsRef<Path>, sync_on_append: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let (next_sequence, offset) = if len == 0 {
            write_file_header(&mut file)?;
            (1, FILE_HEADER_LEN as u64)
        } else {
            validate_file_header(&mut file)?;
            scan_tail(&mut file, len)?
        };
        debug!(?path, next_sequence, offset, "filelog.open");
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                file,
                next_sequence,
                offset,
                closed: false,
            })),
            sync_on_append,
        })
    }

    /// Reads every record back, in address order. Intended for verification
    /// and for readers downstream of the processor.
    pub fn records(&self) -> Result<Vec<(LogAddress, Bytes)>> {
        let mut inner = self.inner.lock();
        let end = inner.offset;
        let mut records = Vec::new();
        let mut pos = FILE_HEADER_LEN as u64;
        inner.file.seek(SeekFrom::Start(pos))?;
        while pos < end {
            let (sequence, payload) = read_record(&mut inner.file)?;
            let advance = (RECORD_HEADER_LEN + payload.len()) as u64;
            records.push((
                LogAddress {
                    sequence,
                    offset: pos,
                },
                payload,
            ));
            pos += advance;
        }
        Ok(records)
    }
}

impl DurableLog for FileLog {
    fn append(&self, payload: Bytes) -> AppendFuture {
        let inner = Arc::clone(&self.inner);
        let sync = self.sync_on_append;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = inner.lock();
                if guard.closed {
                    return Err(StoreError::Closed("durable log"));
                }
                let sequence = guard.next_sequence;
                let offset = guard.offset;
                let header = encode_record_header(payload.len() as u32, sequence, &payload);
                guard.file.seek(SeekFrom::Start(offset))?;
                guard.file.write_all(&header)?;
                guard.file.write_all(&payload)?;
                if sync {
                    guard.file.sync_data()?;
                }
                guard.next_sequence += 1;
                guard.offset = offset + (RECORD_HEADER_LEN + payload.len()) as u64;
                Ok(LogAddress { sequence, offset })
            })
            .await
            .map_err(|_| StoreError::Closed("durable log worker"))?
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        if !guard.closed {
            guard.file.sync_all()?;
            guard.closed = true;
        }
        Ok(())
    }
}

fn crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn write_file_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_LEN];
    header[0..4].copy_from_slice(&FILE_MAGIC);
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    let crc = crc32(&[&header[0..8]]);
    header[8..12].copy_from_slice(&crc.to_be_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.sync_data()?;
    Ok(())
}

fn validate_file_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; FILE_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)
        .map_err(|_| StoreError::Corruption("log file header truncated".into()))?;
    if header[0..4] != FILE_MAGIC {
        return Err(StoreError::Corruption("log file magic mismatch".into()));
    }
    let version = u16::from_be_bytes(header[4..6].try_into().expect("len 2"));
    if version != FORMAT_VERSION {
        return Err(StoreError::Corruption("log file version mismatch".into()));
    }
    let stored = u32::from_be_bytes(header[8..12].try_into().expect("len 4"));
    if crc32(&[&header[0..8]]) != stored {
        return Err(StoreError::Corruption("log file header crc mismatch".into()));
    }
    Ok(())
}

fn encode_record_header(len: u32, sequence: u64, payload: &[u8]) -> [u8; RECORD_HEADER_LEN] {
    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0..4].copy_from_slice(&len.to_be_bytes());
    header[4..12].copy_from_slice(&sequence.to_be_bytes());
    header[12..16].copy_from_slice(&crc32(&[payload]).to_be_bytes());
    let crc = crc32(&[&header[0..16]]);
    header[16..20].copy_from_slice(&crc.to_be_bytes());
    header
}

fn read_record(file: &mut File) -> Result<(u64, Bytes)> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| StoreError::Corruption("log record header truncated".into()))?;
    let stored = u32::from_be_bytes(header[16..20].try_into().expect("len 4"));
    if crc32(&[&header[0..16]]) != stored {
        return Err(StoreError::Corruption("log record header crc mismatch".into()));
    }
    let len = u32::from_be_bytes(header[0..4].try_into().expect("len 4")) as usize;
    let sequence = u64::from_be_bytes(header[4..12].try_into().expect("len 8"));
    let payload_crc = u32::from_be_bytes(header[12..16].try_into().expect("len 4"));
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)
        .map_err(|_| StoreError::Corruption("log record payload truncated".into()))?;
    if crc32(&[&payload]) != payload_crc {
        return Err(StoreError::Corruption("log record payload crc mismatch".into()));
    }
    Ok((sequence, Bytes::from(payload)))
}

fn scan_tail(file: &mut File, len: u64) -> Result<(u64, u64)> {
    let mut pos = FILE_HEADER_LEN as u64;
    let mut next_sequence = 1u64;
    file.seek(SeekFrom::Start(pos))?;
    while pos < len {
        let (sequence, payload) = read_record(file)?;
        if sequence != next_sequence {
            return Err(StoreError::Corruption(
                "log record sequence out of order".into(),
            ));
        }
        next_sequence += 1;
        pos += (RECORD_HEADER_LEN + payload.len()) as u64;
    }
    Ok((next_sequence, pos))
}
