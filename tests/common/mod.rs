#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use decision_ledger::ledger::{CallerContext, CandidateRecord, Clock, Decision, Outcome};
use decision_ledger::{Ledger, LedgerOptions};

/// Clock that only moves when a test moves it.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, seconds: i64) {
        let mut now = self.now.lock().unwrap();
        *now = *now + Duration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// A decision as the scoring service would submit it.
pub fn candidate(i: u64) -> CandidateRecord {
    candidate_with(i, Outcome::Allow, "v1-placeholder")
}

pub fn candidate_with(i: u64, outcome: Outcome, model_version: &str) -> CandidateRecord {
    CandidateRecord::new(
        CallerContext::new("role:service", format!("req-{:04}", i), format!("trace-{:04}", i)),
        Decision::new(outcome, 0.25, model_version, "features-v3")
            .with_reasons(vec!["velocity_ok".to_string()])
            .with_rules_version("rules-2024.03"),
    )
}

/// Temporary directory plus the segment path inside it.
pub fn temp_segment() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decision-ledger.jsonl");
    (dir, path)
}

pub async fn ledger_with_records(path: &Path, count: u64) -> Ledger {
    let ledger = Ledger::open(path, LedgerOptions::default()).unwrap();
    for i in 1..=count {
        ledger.append(candidate(i)).await.unwrap();
    }
    ledger
}

/// Rewrite the file line holding `sequence`, as an attacker with disk
/// access would.
pub fn rewrite_record_line(path: &Path, sequence: u64, edit: impl Fn(&str) -> String) {
    let contents = std::fs::read_to_string(path).unwrap();
    let marker = format!("\"sequence_number\":{},", sequence);
    let rewritten: Vec<String> = contents
        .lines()
        .map(|line| {
            if line.contains("\"kind\":\"record\"") && line.contains(&marker) {
                edit(line)
            } else {
                line.to_string()
            }
        })
        .collect();
    std::fs::write(path, rewritten.join("\n") + "\n").unwrap();
}

pub fn delete_record_line(path: &Path, sequence: u64) {
    let contents = std::fs::read_to_string(path).unwrap();
    let marker = format!("\"sequence_number\":{},", sequence);
    let kept: Vec<&str> = contents
        .lines()
        .filter(|line| !(line.contains("\"kind\":\"record\"") && line.contains(&marker)))
        .collect();
    std::fs::write(path, kept.join("\n") + "\n").unwrap();
}
