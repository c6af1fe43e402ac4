//! Append-only log of checksummed record frames.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::seal::RecordSealer;

/// Size of the `len` + `crc` frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload a single frame may carry.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Records recovered when a log is opened.
#[derive(Debug, Default)]
pub struct Replay {
    /// Record payloads in append order, already unsealed.
    pub records: Vec<Vec<u8>>,
    /// Bytes dropped from the tail because the last frame was torn or damaged.
    pub discarded_bytes: u64,
}

/// An append-only sequence of records over a [`StorageBackend`].
///
/// Opening a log replays every intact frame. The first frame that is short,
/// oversized or fails its checksum marks the end of the log: it and anything
/// after it are truncated away, since a crash can only ever tear the frame
/// that was being appended.
pub struct RecordLog {
    backend: Box<dyn StorageBackend>,
    sealer: Option<RecordSealer>,
    frames: u64,
}

impl RecordLog {
    /// Opens the log stored in `backend`, returning it with its replayed records.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, or [`StorageError::Seal`] if a checksummed frame
    /// cannot be unsealed with `sealer` (typically the wrong key).
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        sealer: Option<RecordSealer>,
    ) -> StorageResult<(Self, Replay)> {
        let size = backend.size()?;
        let mut offset = 0u64;
        let mut raw = Vec::new();

        while let Some((payload, next)) = read_frame(backend.as_ref(), offset, size)? {
            raw.push(payload);
            offset = next;
        }

        let records = match &sealer {
            Some(sealer) => raw
                .iter()
                .map(|payload| sealer.open(payload))
                .collect::<StorageResult<Vec<_>>>()?,
            None => raw,
        };

        let discarded_bytes = size - offset;
        if discarded_bytes > 0 {
            backend.truncate(offset)?;
            backend.sync()?;
        }

        let log = Self {
            backend,
            sealer,
            frames: records.len() as u64,
        };
        Ok((
            log,
            Replay {
                records,
                discarded_bytes,
            },
        ))
    }

    /// Appends one record and returns the offset of its frame.
    ///
    /// The frame is written with a single backend append. Durability still
    /// requires [`RecordLog::sync`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RecordTooLarge`] for oversized records, or an
    /// error from sealing or the backend.
    pub fn append(&mut self, record: &[u8]) -> StorageResult<u64> {
        let frame = encode_frame(self.sealer.as_ref(), record)?;
        let offset = self.backend.append(&frame)?;
        self.frames += 1;
        Ok(offset)
    }

    /// Makes every appended frame durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend sync fails.
    pub fn sync(&mut self) -> StorageResult<()> {
        self.backend.flush()?;
        self.backend.sync()
    }

    /// Writes `records` into `fresh` and switches the log over to it.
    ///
    /// `fresh` is synced before the switch. The previous backend is handed
    /// back so the caller can retire it (e.g. rename the new file over the
    /// old one).
    ///
    /// # Errors
    ///
    /// Returns an error if `fresh` is not empty or any write fails; the log
    /// keeps using its current backend in that case.
    pub fn compact_into<'a>(
        &mut self,
        mut fresh: Box<dyn StorageBackend>,
        records: impl IntoIterator<Item = &'a [u8]>,
    ) -> StorageResult<Box<dyn StorageBackend>> {
        if fresh.size()? != 0 {
            return Err(StorageError::Corrupted(
                "compaction target is not empty".into(),
            ));
        }

        let mut frames = 0u64;
        for record in records {
            let frame = encode_frame(self.sealer.as_ref(), record)?;
            fresh.append(&frame)?;
            frames += 1;
        }
        fresh.flush()?;
        fresh.sync()?;

        self.frames = frames;
        Ok(std::mem::replace(&mut self.backend, fresh))
    }

    /// Number of frames in the log.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> StorageResult<u64> {
        self.backend.size()
    }

    /// Whether records are sealed before framing.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealer.is_some()
    }
}

impl std::fmt::Debug for RecordLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLog")
            .field("frames", &self.frames)
            .field("sealed", &self.sealer.is_some())
            .finish()
    }
}

fn encode_frame(sealer: Option<&RecordSealer>, record: &[u8]) -> StorageResult<Vec<u8>> {
    let payload = match sealer {
        Some(sealer) => sealer.seal(record)?,
        None => record.to_vec(),
    };
    if payload.len() > MAX_RECORD_SIZE {
        return Err(StorageError::RecordTooLarge {
            len: payload.len(),
            max: MAX_RECORD_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads the frame at `offset`, returning its payload and the next offset.
///
/// `None` means the log ends here, cleanly or not.
fn read_frame(
    backend: &dyn StorageBackend,
    offset: u64,
    size: u64,
) -> StorageResult<Option<(Vec<u8>, u64)>> {
    let header_end = offset + FRAME_HEADER_SIZE as u64;
    if header_end > size {
        return Ok(None);
    }

    let header = backend.read_at(offset, FRAME_HEADER_SIZE)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let end = header_end + len as u64;
    if len > MAX_RECORD_SIZE || end > size {
        return Ok(None);
    }

    let payload = backend.read_at(header_end, len)?;
    if compute_crc32(&payload) != crc {
        return Ok(None);
    }
    Ok(Some((payload, end)))
}

/// CRC-32 (IEEE polynomial) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use crate::seal::SealingKey;

    fn open_memory(data: Vec<u8>) -> (RecordLog, Replay) {
        RecordLog::open(Box::new(InMemoryBackend::with_data(data)), None).unwrap()
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn frames_round_trip_through_reopen() {
        let mut bytes = Vec::new();
        for record in [&b"one"[..], b"", b"three"] {
            bytes.extend(encode_frame(None, record).unwrap());
        }

        let (log, replay) = open_memory(bytes);
        assert_eq!(replay.records, vec![b"one".to_vec(), vec![], b"three".to_vec()]);
        assert_eq!(replay.discarded_bytes, 0);
        assert_eq!(log.frame_count(), 3);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let mut bytes = encode_frame(None, b"complete").unwrap();
        let intact = bytes.len() as u64;
        let torn = encode_frame(None, b"half-written").unwrap();
        bytes.extend_from_slice(&torn[..torn.len() - 3]);

        let (mut log, replay) = open_memory(bytes);
        assert_eq!(replay.records, vec![b"complete".to_vec()]);
        assert_eq!(replay.discarded_bytes, torn.len() as u64 - 3);
        assert_eq!(log.size().unwrap(), intact);

        // New appends land right after the last intact frame.
        assert_eq!(log.append(b"next").unwrap(), intact);
    }

    #[test]
    fn checksum_mismatch_ends_the_log() {
        let mut bytes = encode_frame(None, b"good").unwrap();
        let mut bad = encode_frame(None, b"flipped").unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        bytes.extend(bad);
        bytes.extend(encode_frame(None, b"after").unwrap());

        let (_, replay) = open_memory(bytes);
        assert_eq!(replay.records, vec![b"good".to_vec()]);
        assert!(replay.discarded_bytes > 0);
    }

    #[test]
    fn sealed_log_hides_plaintext() {
        let key = SealingKey::generate();
        let backend = InMemoryBackend::new();
        let (mut log, _) =
            RecordLog::open(Box::new(backend), Some(RecordSealer::new(&key))).unwrap();
        assert!(log.is_sealed());
        log.append(b"password=hunter2").unwrap();

        let fresh = Box::new(InMemoryBackend::new());
        let old = log.compact_into(fresh, [&b"password=hunter2"[..]]).unwrap();
        let raw = old.read_at(0, old.size().unwrap() as usize).unwrap();
        assert!(!raw.windows(7).any(|w| w == b"hunter2"));
    }

    #[test]
    fn compaction_replaces_backend() {
        let (mut log, _) = open_memory(Vec::new());
        for i in 0..10u8 {
            log.append(&[i]).unwrap();
        }
        let live = [vec![9u8]];
        log.compact_into(
            Box::new(InMemoryBackend::new()),
            live.iter().map(Vec::as_slice),
        )
        .unwrap();
        assert_eq!(log.frame_count(), 1);
        assert_eq!(log.size().unwrap(), (FRAME_HEADER_SIZE + 1) as u64);
    }

    #[test]
    fn compaction_requires_empty_target() {
        let (mut log, _) = open_memory(Vec::new());
        let busy = InMemoryBackend::with_data(vec![1, 2, 3]);
        assert!(log.compact_into(Box::new(busy), []).is_err());
    }

    #[test]
    fn oversized_record_is_rejected() {
        let (mut log, _) = open_memory(Vec::new());
        let big = vec![0u8; MAX_RECORD_SIZE + 1];
        assert!(matches!(
            log.append(&big),
            Err(StorageError::RecordTooLarge { .. })
        ));
        assert_eq!(log.frame_count(), 0);
    }
}
