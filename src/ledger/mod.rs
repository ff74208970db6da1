//! Decision Ledger
//!
//! Append-only, hash-chained store of fraud-scoring decisions. Each
//! [`Ledger`] owns one segment file; appends are serialized through a
//! single writer while verification and queries read published
//! snapshots concurrently.

pub mod clock;
pub mod hash;
pub mod merkle;
pub mod pii;
pub mod query;
pub mod record;
pub mod store;
pub mod verify;

pub use clock::{Clock, SystemClock};
pub use hash::HashAlgorithm;
pub use merkle::MerkleProof;
pub use pii::{PiiDenylist, PiiPatternConfig};
pub use query::{query_segment_file, QueryFilter, RecordStream};
pub use record::{CallerContext, CandidateRecord, Decision, DecisionOutput, DecisionRecord, Outcome};
pub use store::{SealReceipt, SegmentHeader};
pub use verify::{verify_segment_file, VerificationResult};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::LedgerError;
use store::{SegmentFile, SegmentLine, SegmentScan, Slot};

/// How a ledger hashes, persists, screens and timestamps records.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Used when creating a segment; existing segments keep their own.
    pub algorithm: HashAlgorithm,
    pub sync_on_append: bool,
    pub denylist: PiiDenylist,
    pub clock: Arc<dyn Clock>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::default(),
            sync_on_append: true,
            denylist: PiiDenylist::standard(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl LedgerOptions {
    pub fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        Ok(Self {
            algorithm: config.hash_algorithm,
            sync_on_append: config.sync_on_append,
            denylist: config.denylist()?,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_denylist(mut self, denylist: PiiDenylist) -> Self {
        self.denylist = denylist;
        self
    }

    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }
}

/// Latest committed position of the chain.
///
/// For a segment with no records, `sequence_number` is one less than the
/// segment's first sequence and `hash` is its seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tip {
    pub sequence_number: u64,
    pub hash: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LedgerState {
    Open,
    Sealed,
}

#[derive(Debug)]
struct Writer {
    segment: SegmentFile,
    tip: Tip,
    sealed: bool,
}

/// What readers see. Tip and index change together.
#[derive(Debug)]
struct Published {
    tip: Tip,
    offsets: Vec<u64>,
    seal: Option<SealReceipt>,
}

#[derive(Debug)]
struct LedgerInner {
    path: PathBuf,
    header: SegmentHeader,
    denylist: PiiDenylist,
    clock: Arc<dyn Clock>,
    writer: Mutex<Writer>,
    published: RwLock<Published>,
}

/// Handle to one ledger segment. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

/// Tip implied by a scan, checking the tail record before trusting it.
fn derive_tip(header: &SegmentHeader, scan: &SegmentScan) -> Result<Tip, LedgerError> {
    if header.first_sequence == 0 {
        return Err(LedgerError::MalformedSegment(
            "segment header has first_sequence 0".to_string(),
        ));
    }

    let count = scan.offsets.len() as u64;
    if count == 0 {
        return Ok(Tip {
            sequence_number: header.first_sequence - 1,
            hash: header.seed_hash.clone(),
            timestamp: header.seed_timestamp,
        });
    }

    let last_sequence = header.first_sequence + count - 1;
    let corrupted = |sequence: u64, reason: &str| LedgerError::Corrupted {
        sequence,
        reason: reason.to_string(),
    };

    let last = scan
        .last
        .as_ref()
        .and_then(Slot::record)
        .ok_or_else(|| corrupted(last_sequence, "tail record unreadable"))?;
    if last.sequence_number != last_sequence {
        return Err(corrupted(last_sequence, "tail record out of sequence"));
    }

    let expected_prev = if count == 1 {
        header.seed_hash.as_str()
    } else {
        scan.previous
            .as_ref()
            .and_then(Slot::record)
            .map(|prev| prev.record_hash.as_str())
            .ok_or_else(|| corrupted(last_sequence - 1, "record before tail unreadable"))?
    };
    if last.prev_hash != expected_prev {
        return Err(corrupted(last_sequence, "tail record does not link to its predecessor"));
    }
    if !last.verify_hash(header.algorithm) {
        return Err(corrupted(last_sequence, "tail record hash mismatch"));
    }

    Ok(Tip {
        sequence_number: last_sequence,
        hash: last.record_hash.clone(),
        timestamp: Some(last.timestamp),
    })
}

fn check_seal(tip: &Tip, seal: Option<&SealReceipt>) -> Result<(), LedgerError> {
    match seal {
        Some(receipt)
            if receipt.last_sequence != tip.sequence_number || receipt.final_hash != tip.hash =>
        {
            Err(LedgerError::Corrupted {
                sequence: receipt.last_sequence,
                reason: "seal does not match segment tail".to_string(),
            })
        }
        _ => Ok(()),
    }
}

impl Ledger {
    /// Open the segment at `path`, creating a root segment if it does not
    /// exist. Runs recovery on the existing contents.
    pub fn open(path: impl AsRef<Path>, options: LedgerOptions) -> Result<Self, LedgerError> {
        let header = SegmentHeader::root(options.algorithm);
        Self::open_with_header(path.as_ref(), header, options, false)
    }

    /// Open (or create) the segment that continues the chain sealed by
    /// `receipt`.
    pub fn open_successor(
        path: impl AsRef<Path>,
        receipt: &SealReceipt,
        options: LedgerOptions,
    ) -> Result<Self, LedgerError> {
        let header = SegmentHeader::successor(receipt, options.algorithm);
        Self::open_with_header(path.as_ref(), header, options, true)
    }

    fn open_with_header(
        path: &Path,
        header: SegmentHeader,
        options: LedgerOptions,
        require_origin: bool,
    ) -> Result<Self, LedgerError> {
        let (segment, scan) =
            SegmentFile::open_or_create(path, header.clone(), options.sync_on_append)?;
        let stored = scan.header.clone().ok_or_else(|| {
            LedgerError::MalformedSegment(format!("{} has no header", path.display()))
        })?;

        if require_origin && !stored.same_origin(&header) {
            return Err(LedgerError::MalformedSegment(format!(
                "{} does not continue segment {}",
                path.display(),
                header.segment_id.saturating_sub(1)
            )));
        }
        if stored.algorithm != options.algorithm {
            warn!(
                "Segment {} uses {}; configured {} applies to new segments only",
                path.display(),
                stored.algorithm,
                options.algorithm
            );
        }

        let tip = derive_tip(&stored, &scan)?;
        check_seal(&tip, scan.seal.as_ref())?;
        let sealed = scan.seal.is_some();

        info!(
            "Opened segment {} at {} (tip {}, {})",
            stored.segment_id,
            path.display(),
            tip.sequence_number,
            if sealed { "sealed" } else { "open" }
        );

        let inner = LedgerInner {
            path: path.to_path_buf(),
            header: stored,
            denylist: options.denylist,
            clock: options.clock,
            writer: Mutex::new(Writer {
                segment,
                tip: tip.clone(),
                sealed,
            }),
            published: RwLock::new(Published {
                tip,
                offsets: scan.offsets,
                seal: scan.seal,
            }),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn published(&self) -> RwLockReadGuard<'_, Published> {
        self.inner
            .published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn published_mut(&self) -> RwLockWriteGuard<'_, Published> {
        self.inner
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sealed_error(&self) -> LedgerError {
        LedgerError::SealedLedgerWriteAttempt {
            segment_id: self.inner.header.segment_id,
        }
    }

    /// Validate, chain and durably persist `candidate`, returning its
    /// sequence number. Nothing is written when validation fails.
    pub async fn append(&self, candidate: CandidateRecord) -> Result<u64, LedgerError> {
        if self.published().seal.is_some() {
            return Err(self.sealed_error());
        }
        candidate.validate()?;
        self.inner.denylist.check(&candidate)?;

        let mut writer = self.inner.writer.lock().await;
        if writer.sealed {
            return Err(self.sealed_error());
        }

        let sequence_number = writer.tip.sequence_number + 1;
        let now = self.inner.clock.now();
        let timestamp = match writer.tip.timestamp {
            Some(previous) if previous > now => previous,
            _ => now,
        };

        let record = DecisionRecord::link(
            candidate,
            sequence_number,
            timestamp,
            writer.tip.hash.clone(),
            self.inner.header.algorithm,
        )?;
        let record_hash = record.record_hash.clone();
        let summary = record.summary();

        let offset = writer.segment.append_line(&SegmentLine::Record(record))?;

        let tip = Tip {
            sequence_number,
            hash: record_hash,
            timestamp: Some(timestamp),
        };
        writer.tip = tip.clone();
        {
            let mut published = self.published_mut();
            published.offsets.push(offset);
            published.tip = tip;
        }

        debug!("Appended decision record: {}", summary);
        Ok(sequence_number)
    }

    /// Recompute the chain over `from..=to`.
    pub fn verify(&self, from: u64, to: u64) -> Result<VerificationResult, LedgerError> {
        let first = self.inner.header.first_sequence;
        let start = {
            let published = self.published();
            verify::check_range(first, published.tip.sequence_number, from, to)?;
            verify::start_offset(first, &published.offsets, from)
        };
        verify::verify_range(&self.inner.path, &self.inner.header, start, from, to)
    }

    /// Verify every record in the segment. An empty segment is intact.
    pub fn verify_all(&self) -> Result<VerificationResult, LedgerError> {
        let tip = self.tip();
        let first = self.inner.header.first_sequence;
        if tip.sequence_number < first {
            return Ok(VerificationResult::Intact);
        }
        self.verify(first, tip.sequence_number)
    }

    /// Lazily stream records matching `filter`, up to the current tip.
    pub fn query(&self, filter: QueryFilter) -> RecordStream {
        let published = self.published();
        RecordStream::new(
            self.inner.path.clone(),
            filter,
            self.inner.header.first_sequence,
            published.tip.sequence_number,
            &published.offsets,
        )
    }

    fn record_hashes(&self, from: u64, to: u64) -> Result<Vec<String>, LedgerError> {
        self.query(QueryFilter::new().sequence_range(from, to))
            .map(|record| record.map(|r| r.record_hash))
            .collect()
    }

    /// Merkle root over the record hashes in `from..=to`.
    pub fn merkle_root(&self, from: u64, to: u64) -> Result<String, LedgerError> {
        let first = self.inner.header.first_sequence;
        verify::check_range(first, self.tip().sequence_number, from, to)?;
        let hashes = self.record_hashes(from, to)?;
        merkle::merkle_root(&hashes, self.inner.header.algorithm)
            .ok_or(LedgerError::InvalidRange { from, to })
    }

    /// Inclusion proof for `sequence_number` under the root of the whole
    /// segment up to the current tip.
    pub fn inclusion_proof(&self, sequence_number: u64) -> Result<MerkleProof, LedgerError> {
        let first = self.inner.header.first_sequence;
        let tip = self.tip().sequence_number;
        verify::check_range(first, tip, sequence_number, sequence_number)?;
        let hashes = self.record_hashes(first, tip)?;
        merkle::generate_proof(
            &hashes,
            (sequence_number - first) as usize,
            self.inner.header.algorithm,
        )
    }

    /// Permanently close this segment to appends.
    pub async fn seal(&self) -> Result<SealReceipt, LedgerError> {
        let mut writer = self.inner.writer.lock().await;
        let header = &self.inner.header;
        if writer.sealed {
            return Err(self.sealed_error());
        }

        let tip = writer.tip.clone();
        let record_count = tip.sequence_number + 1 - header.first_sequence;
        let merkle_root = if record_count == 0 {
            None
        } else {
            let hashes = self.record_hashes(header.first_sequence, tip.sequence_number)?;
            merkle::merkle_root(&hashes, header.algorithm)
        };

        let receipt = SealReceipt {
            segment_id: header.segment_id,
            first_sequence: header.first_sequence,
            last_sequence: tip.sequence_number,
            record_count,
            final_hash: tip.hash,
            last_timestamp: tip.timestamp,
            merkle_root,
            sealed_at: self.inner.clock.now(),
        };

        writer.segment.append_line(&SegmentLine::Seal(receipt.clone()))?;
        writer.sealed = true;
        self.published_mut().seal = Some(receipt.clone());

        info!("Sealed {}", receipt.summary());
        Ok(receipt)
    }

    /// Re-read the segment and reset the tip from its last record.
    ///
    /// Picks up a record that reached disk without the tip advancing and
    /// drops a torn tail. Running it again without new writes yields the
    /// same tip.
    pub async fn recover(&self) -> Result<Tip, LedgerError> {
        let mut writer = self.inner.writer.lock().await;
        let scan = writer.segment.rescan()?;

        match &scan.header {
            Some(stored) if stored.same_origin(&self.inner.header) => {}
            _ => {
                return Err(LedgerError::MalformedSegment(format!(
                    "{} header changed on disk",
                    self.inner.path.display()
                )))
            }
        }

        let tip = derive_tip(&self.inner.header, &scan)?;
        check_seal(&tip, scan.seal.as_ref())?;

        if tip != writer.tip {
            info!(
                "Recovered tip {} (was {})",
                tip.sequence_number, writer.tip.sequence_number
            );
        }
        writer.tip = tip.clone();
        writer.sealed = scan.seal.is_some();
        {
            let mut published = self.published_mut();
            published.tip = tip.clone();
            published.offsets = scan.offsets;
            published.seal = scan.seal;
        }

        Ok(tip)
    }

    pub fn tip(&self) -> Tip {
        self.published().tip.clone()
    }

    pub fn state(&self) -> LedgerState {
        if self.published().seal.is_some() {
            LedgerState::Sealed
        } else {
            LedgerState::Open
        }
    }

    pub fn seal_receipt(&self) -> Option<SealReceipt> {
        self.published().seal.clone()
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.inner.header
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}
