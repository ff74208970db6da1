//! Ledger Queries
//!
//! Filtered, lazy iteration over records in ascending sequence order.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::LedgerError;
use crate::ledger::record::DecisionRecord;
use crate::ledger::store::{scan_segment, SegmentReader, Slot};

/// Conjunction of optional record predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub from_sequence: Option<u64>,
    pub to_sequence: Option<u64>,
    pub caller_identity: Option<String>,
    pub model_version: Option<String>,
    pub request_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence_range(mut self, from: u64, to: u64) -> Self {
        self.from_sequence = Some(from);
        self.to_sequence = Some(to);
        self
    }

    pub fn caller_identity(mut self, caller_identity: impl Into<String>) -> Self {
        self.caller_identity = Some(caller_identity.into());
        self
    }

    pub fn model_version(mut self, model_version: impl Into<String>) -> Self {
        self.model_version = Some(model_version.into());
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn time_range(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn matches(&self, record: &DecisionRecord) -> bool {
        let seq = record.sequence_number;
        self.from_sequence.map_or(true, |from| seq >= from)
            && self.to_sequence.map_or(true, |to| seq <= to)
            && self
                .caller_identity
                .as_ref()
                .map_or(true, |c| *c == record.caller_identity)
            && self
                .model_version
                .as_ref()
                .map_or(true, |m| *m == record.model_version)
            && self
                .request_id
                .as_ref()
                .map_or(true, |r| *r == record.request_id)
            && self.since.map_or(true, |since| record.timestamp >= since)
            && self.until.map_or(true, |until| record.timestamp <= until)
    }
}

/// Lazy, restartable stream of matching records.
///
/// Bounded by the ledger tip when the stream was created; records appended
/// later are not visited. The file is opened on the first pull and read one
/// line at a time.
pub struct RecordStream {
    path: PathBuf,
    filter: QueryFilter,
    /// First sequence number to visit and its byte offset.
    start: Option<(u64, u64)>,
    last_sequence: u64,
    next_sequence: u64,
    reader: Option<SegmentReader>,
    finished: bool,
}

impl RecordStream {
    pub(crate) fn new(
        path: PathBuf,
        filter: QueryFilter,
        first_sequence: u64,
        tip_sequence: u64,
        offsets: &[u64],
    ) -> Self {
        let from = filter.from_sequence.unwrap_or(first_sequence).max(first_sequence);
        let to = filter.to_sequence.map_or(tip_sequence, |to| to.min(tip_sequence));
        let start = if from <= to {
            Some((from, offsets[(from - first_sequence) as usize]))
        } else {
            None
        };

        Self {
            path,
            filter,
            start,
            last_sequence: to,
            next_sequence: from,
            reader: None,
            finished: start.is_none(),
        }
    }

    /// Rewind to the first record of the range.
    pub fn restart(&mut self) {
        self.reader = None;
        self.finished = self.start.is_none();
        if let Some((from, _)) = self.start {
            self.next_sequence = from;
        }
    }

    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    fn fail(&mut self, err: LedgerError) -> Option<Result<DecisionRecord, LedgerError>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl Iterator for RecordStream {
    type Item = Result<DecisionRecord, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.reader.is_none() {
            let (_, offset) = self.start?;
            match SegmentReader::open_at(&self.path, offset) {
                Ok(reader) => self.reader = Some(reader),
                Err(err) => return self.fail(err),
            }
        }

        while self.next_sequence <= self.last_sequence {
            let expected = self.next_sequence;
            let slot = match self.reader.as_mut() {
                Some(reader) => reader.next_slot(),
                None => return None,
            };

            let record = match slot {
                Ok(Some(Slot::Parsed(record))) if record.sequence_number == expected => record,
                Ok(_) => {
                    return self.fail(LedgerError::Corrupted {
                        sequence: expected,
                        reason: "record missing or unreadable".to_string(),
                    })
                }
                Err(err) => return self.fail(err),
            };
            self.next_sequence += 1;

            // Timestamps never decrease, so nothing later can match.
            if self.filter.until.map_or(false, |until| record.timestamp > until) {
                break;
            }
            if self.filter.matches(&record) {
                return Some(Ok(record));
            }
        }

        self.finished = true;
        None
    }
}

/// Query a segment file on disk without opening it for writing.
pub fn query_segment_file(path: &Path, filter: QueryFilter) -> Result<RecordStream, LedgerError> {
    let scan = scan_segment(path)?;
    let header = scan
        .header
        .ok_or_else(|| LedgerError::MalformedSegment(format!("{} is empty", path.display())))?;
    if header.first_sequence == 0 {
        return Err(LedgerError::MalformedSegment(
            "segment header has first_sequence 0".to_string(),
        ));
    }
    let tip = header.first_sequence + scan.offsets.len() as u64 - 1;
    Ok(RecordStream::new(
        path.to_path_buf(),
        filter,
        header.first_sequence,
        tip,
        &scan.offsets,
    ))
}
