use tracing::warn;

use chanstore_file::{read_range, FileHandle};
use chanstore_types::{EntityId, TaskTimestamp};

use crate::error::{EngineError, EngineResult};

/// Size of the fixed record header:
/// `[length: u32 LE][crc: u32 LE][entity: u64 LE][timestamp: u64 LE][kind: u8]`.
pub const RECORD_HEADER_SIZE: usize = 25;

/// Kind of a stored record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Payload of an entity.
    Entity,
    /// Marks a collected entity; carries no payload.
    Tombstone,
}

impl RecordKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Entity => 1,
            Self::Tombstone => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Entity),
            2 => Some(Self::Tombstone),
            _ => None,
        }
    }
}

/// Largest payload a record can hold.
pub const MAX_PAYLOAD_LENGTH: usize = u32::MAX as usize;

fn payload_length(entity: EntityId, length: usize) -> EngineResult<u32> {
    u32::try_from(length).map_err(|_| EngineError::PayloadTooLarge { entity, length })
}

/// Encode one record (header + payload).
pub fn encode_record(
    entity: EntityId,
    timestamp: TaskTimestamp,
    kind: RecordKind,
    payload: &[u8],
) -> EngineResult<Vec<u8>> {
    let length = payload_length(entity, payload.len())?;
    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    record.extend_from_slice(&length.to_le_bytes());
    record.extend_from_slice(&0u32.to_le_bytes());
    record.extend_from_slice(&entity.get().to_le_bytes());
    record.extend_from_slice(&timestamp.get().to_le_bytes());
    record.push(kind.to_byte());
    record.extend_from_slice(payload);

    let crc = crc32fast::hash(&record[8..]);
    record[4..8].copy_from_slice(&crc.to_le_bytes());
    Ok(record)
}

/// A decoded record header plus its position in the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScannedRecord {
    pub entity: EntityId,
    pub timestamp: TaskTimestamp,
    pub kind: RecordKind,
    /// Offset of the record start (header included).
    pub position: u64,
    /// Total record length (header included).
    pub length: u64,
}

/// Result of scanning a data file front to back.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub records: Vec<ScannedRecord>,
    /// Length of the intact prefix. Shorter than the file if its tail is torn
    /// or corrupt.
    pub valid_length: u64,
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Decode the record starting at the beginning of `bytes`.
///
/// Returns `None` if `bytes` holds no complete, intact record.
fn decode(bytes: &[u8], position: u64) -> Option<ScannedRecord> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let payload_length = u32_at(bytes, 0) as usize;
    let total = RECORD_HEADER_SIZE.checked_add(payload_length)?;
    if bytes.len() < total {
        return None;
    }
    let expected_crc = u32_at(bytes, 4);
    if crc32fast::hash(&bytes[8..total]) != expected_crc {
        return None;
    }
    Some(ScannedRecord {
        entity: EntityId::new(u64_at(bytes, 8)),
        timestamp: TaskTimestamp::new(u64_at(bytes, 16)),
        kind: RecordKind::from_byte(bytes[24])?,
        position,
        length: total as u64,
    })
}

/// Scan all intact records of `file`, stopping at the first torn or corrupt one.
pub fn scan_records(file: &FileHandle) -> EngineResult<ScanOutcome> {
    let size = file.size()?;
    let bytes = read_range(file.backend(), 0, size)?;

    let mut outcome = ScanOutcome::default();
    let mut offset = 0usize;
    while offset < bytes.len() {
        match decode(&bytes[offset..], offset as u64) {
            Some(record) => {
                offset += record.length as usize;
                outcome.records.push(record);
            }
            None => {
                warn!(
                    file = %file.identifier(),
                    offset,
                    trailing = bytes.len() - offset,
                    "torn or corrupt record; stopping scan"
                );
                break;
            }
        }
    }
    outcome.valid_length = offset as u64;
    Ok(outcome)
}

/// Read and verify the record at `position`, returning its payload.
pub fn read_payload(file: &FileHandle, position: u64, length: u64) -> EngineResult<Vec<u8>> {
    let bytes = read_range(file.backend(), position, length)?;
    let record = decode(&bytes, position).ok_or_else(|| EngineError::CorruptRecord {
        file: file.identifier().to_string(),
        position,
        reason: "checksum or length mismatch".to_string(),
    })?;
    if record.length != length {
        return Err(EngineError::CorruptRecord {
            file: file.identifier().to_string(),
            position,
            reason: format!("expected record length {length}, found {}", record.length),
        });
    }
    Ok(bytes[RECORD_HEADER_SIZE..].to_vec())
}

/// Read the raw bytes (header included) of the record at `position`.
pub fn read_raw(file: &FileHandle, position: u64, length: u64) -> EngineResult<Vec<u8>> {
    Ok(read_range(file.backend(), position, length)?)
}
