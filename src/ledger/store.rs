//! Segment Store
//!
//! One segment is an append-only JSON-Lines file: a header line, then one
//! line per decision record, then optionally a seal line. Appends are
//! written and fsynced before they are acknowledged; a failed write is
//! truncated away so no partial record survives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::ledger::hash::HashAlgorithm;
use crate::ledger::record::DecisionRecord;

/// First line of every segment: where this segment sits in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub segment_id: u64,
    pub first_sequence: u64,
    pub seed_hash: String,
    #[serde(default)]
    pub seed_timestamp: Option<DateTime<Utc>>,
    pub algorithm: HashAlgorithm,
    pub created_at: DateTime<Utc>,
}

impl SegmentHeader {
    /// Header for the first segment of a brand-new ledger.
    pub fn root(algorithm: HashAlgorithm) -> Self {
        Self {
            segment_id: 1,
            first_sequence: 1,
            seed_hash: algorithm.zero_hash(),
            seed_timestamp: None,
            algorithm,
            created_at: Utc::now(),
        }
    }

    /// Header continuing the chain of a sealed segment.
    pub fn successor(receipt: &SealReceipt, algorithm: HashAlgorithm) -> Self {
        Self {
            segment_id: receipt.segment_id + 1,
            first_sequence: receipt.last_sequence + 1,
            seed_hash: receipt.final_hash.clone(),
            seed_timestamp: receipt.last_timestamp,
            algorithm,
            created_at: Utc::now(),
        }
    }

    /// Same chain position, ignoring creation time.
    pub fn same_origin(&self, other: &SegmentHeader) -> bool {
        self.segment_id == other.segment_id
            && self.first_sequence == other.first_sequence
            && self.seed_hash == other.seed_hash
    }
}

/// Written as the final line when a segment is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealReceipt {
    pub segment_id: u64,
    pub first_sequence: u64,
    /// Equals `first_sequence - 1` for a segment sealed while empty.
    pub last_sequence: u64,
    pub record_count: u64,
    pub final_hash: String,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub merkle_root: Option<String>,
    pub sealed_at: DateTime<Utc>,
}

impl SealReceipt {
    pub fn summary(&self) -> String {
        format!(
            "Segment {}: {} records ({}..={}), final hash {}",
            self.segment_id,
            self.record_count,
            self.first_sequence,
            self.last_sequence,
            self.final_hash
        )
    }
}

/// One line of a segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentLine {
    Header(SegmentHeader),
    Record(DecisionRecord),
    Seal(SealReceipt),
}

/// A record position in the file, parsed or not.
#[derive(Debug, Clone)]
pub enum Slot {
    Parsed(DecisionRecord),
    Unreadable,
}

impl Slot {
    pub fn record(&self) -> Option<&DecisionRecord> {
        match self {
            Slot::Parsed(record) => Some(record),
            Slot::Unreadable => None,
        }
    }
}

/// Result of reading a segment front to back.
#[derive(Debug, Clone, Default)]
pub struct SegmentScan {
    pub header: Option<SegmentHeader>,
    /// Byte offset of every record slot, in file order.
    pub offsets: Vec<u64>,
    pub previous: Option<Slot>,
    pub last: Option<Slot>,
    pub seal: Option<SealReceipt>,
    /// Length of the prefix made of complete lines.
    pub committed_len: u64,
    /// Bytes after the last newline, left by an interrupted write.
    pub torn_bytes: u64,
}

/// Read a segment without modifying it.
pub fn scan_segment(path: &Path) -> Result<SegmentScan, LedgerError> {
    let file = File::open(path).map_err(|e| LedgerError::store_unavailable("open segment", e))?;
    let mut reader = BufReader::new(file);
    let mut scan = SegmentScan::default();
    let mut buf = Vec::new();
    let mut offset = 0u64;
    let mut line_index = 0usize;

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| LedgerError::store_unavailable("read segment", e))?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            scan.torn_bytes = n as u64;
            break;
        }

        let line_offset = offset;
        offset += n as u64;
        let parsed = serde_json::from_slice::<SegmentLine>(&buf).ok();

        if scan.seal.is_some() {
            return Err(LedgerError::MalformedSegment(format!(
                "data after seal at byte {} of {}",
                line_offset,
                path.display()
            )));
        }

        if line_index == 0 {
            match parsed {
                Some(SegmentLine::Header(header)) => scan.header = Some(header),
                _ => {
                    return Err(LedgerError::MalformedSegment(format!(
                        "{} does not start with a segment header",
                        path.display()
                    )))
                }
            }
            line_index += 1;
            continue;
        }
        line_index += 1;

        let slot = match parsed {
            Some(SegmentLine::Header(_)) => {
                return Err(LedgerError::MalformedSegment(format!(
                    "duplicate header at byte {} of {}",
                    line_offset,
                    path.display()
                )))
            }
            Some(SegmentLine::Seal(receipt)) => {
                scan.seal = Some(receipt);
                continue;
            }
            Some(SegmentLine::Record(record)) => Slot::Parsed(record),
            None => Slot::Unreadable,
        };
        scan.offsets.push(line_offset);
        scan.previous = scan.last.take();
        scan.last = Some(slot);
    }

    scan.committed_len = offset;
    debug!(
        "Scanned {}: {} record slots, {} torn bytes",
        path.display(),
        scan.offsets.len(),
        scan.torn_bytes
    );
    Ok(scan)
}

/// Write handle for one segment file.
#[derive(Debug)]
pub struct SegmentFile {
    path: PathBuf,
    file: File,
    len: u64,
    sync_on_append: bool,
    poisoned: bool,
    #[cfg(test)]
    faults: Faults,
}

/// Failures to inject into the next append.
#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
    write: bool,
    rollback: bool,
}

impl SegmentFile {
    /// Open `path`, creating it with `header` if it holds no header yet.
    /// A torn tail from an interrupted append is truncated.
    pub fn open_or_create(
        path: &Path,
        header: SegmentHeader,
        sync_on_append: bool,
    ) -> Result<(Self, SegmentScan), LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::store_unavailable("create segment directory", e))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| LedgerError::store_unavailable("open segment", e))?;

        let mut segment = Self {
            path: path.to_path_buf(),
            file,
            len: 0,
            sync_on_append,
            poisoned: false,
            #[cfg(test)]
            faults: Faults::default(),
        };

        let mut scan = segment.rescan()?;
        if scan.header.is_none() {
            segment.append_line(&SegmentLine::Header(header.clone()))?;
            info!(
                "Created segment {} at {}",
                header.segment_id,
                path.display()
            );
            scan.header = Some(header);
            scan.committed_len = segment.len;
        }

        Ok((segment, scan))
    }

    /// Re-read the file from disk, dropping any torn tail.
    pub fn rescan(&mut self) -> Result<SegmentScan, LedgerError> {
        let scan = scan_segment(&self.path)?;
        if scan.torn_bytes > 0 {
            warn!(
                path = %self.path.display(),
                torn_bytes = scan.torn_bytes,
                "Truncating torn tail from segment"
            );
            self.file
                .set_len(scan.committed_len)
                .and_then(|_| self.file.sync_all())
                .map_err(|e| LedgerError::store_unavailable("truncate torn tail", e))?;
        }
        self.len = scan.committed_len;
        self.poisoned = false;
        Ok(scan)
    }

    /// Durably append one line. Returns the byte offset it starts at.
    pub fn append_line(&mut self, line: &SegmentLine) -> Result<u64, LedgerError> {
        if self.poisoned {
            return Err(LedgerError::StoreUnavailable(format!(
                "{} needs recovery after a failed rollback",
                self.path.display()
            )));
        }

        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');

        let offset = self.len;
        if let Err(err) = self.write_durably(&bytes) {
            self.rollback(offset);
            return Err(LedgerError::store_unavailable("append to segment", err));
        }

        self.len += bytes.len() as u64;
        Ok(offset)
    }

    fn write_durably(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(err) = self.injected_write_failure(bytes) {
            return Err(err);
        }
        self.file.write_all(bytes)?;
        if self.sync_on_append {
            self.file.sync_data()
        } else {
            self.file.flush()
        }
    }

    fn rollback(&mut self, len: u64) {
        let result = match self.injected_rollback_failure() {
            Some(err) => Err(err),
            None => self.file.set_len(len).and_then(|_| self.file.sync_all()),
        };
        match result {
            Ok(()) => debug!("Rolled back {} to {} bytes", self.path.display(), len),
            Err(err) => {
                error!(
                    "Failed to roll back {} after write error: {}",
                    self.path.display(),
                    err
                );
                self.poisoned = true;
            }
        }
    }

    /// Make the next append fail after writing half its line, and
    /// optionally make the rollback fail too.
    #[cfg(test)]
    pub(crate) fn inject_failure(&mut self, fail_rollback: bool) {
        self.faults = Faults {
            write: true,
            rollback: fail_rollback,
        };
    }

    #[cfg(test)]
    fn injected_write_failure(&mut self, bytes: &[u8]) -> Option<std::io::Error> {
        if !std::mem::take(&mut self.faults.write) {
            return None;
        }
        Some(match self.file.write_all(&bytes[..bytes.len() / 2]) {
            Ok(()) => std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"),
            Err(err) => err,
        })
    }

    #[cfg(not(test))]
    fn injected_write_failure(&mut self, _bytes: &[u8]) -> Option<std::io::Error> {
        None
    }

    #[cfg(test)]
    fn injected_rollback_failure(&mut self) -> Option<std::io::Error> {
        std::mem::take(&mut self.faults.rollback)
            .then(|| std::io::Error::new(std::io::ErrorKind::Other, "injected rollback failure"))
    }

    #[cfg(not(test))]
    fn injected_rollback_failure(&mut self) -> Option<std::io::Error> {
        None
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Sequential reader over record slots, starting at a known offset.
pub struct SegmentReader {
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl SegmentReader {
    pub fn open_at(path: &Path, offset: u64) -> Result<Self, LedgerError> {
        let mut file =
            File::open(path).map_err(|e| LedgerError::store_unavailable("open segment", e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| LedgerError::store_unavailable("seek segment", e))?;
        Ok(Self {
            reader: BufReader::new(file),
            buf: Vec::new(),
        })
    }

    /// Next complete line as a record slot; `None` at end of file.
    /// Anything that is not a record line is `Slot::Unreadable`.
    pub fn next_slot(&mut self) -> Result<Option<Slot>, LedgerError> {
        self.buf.clear();
        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .map_err(|e| LedgerError::store_unavailable("read segment", e))?;
        if n == 0 || self.buf.last() != Some(&b'\n') {
            return Ok(None);
        }
        Ok(Some(match serde_json::from_slice::<SegmentLine>(&self.buf) {
            Ok(SegmentLine::Record(record)) => Slot::Parsed(record),
            _ => Slot::Unreadable,
        }))
    }
}
