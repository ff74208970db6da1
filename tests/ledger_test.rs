//! Decision Ledger Tests
//!
//! Append, verification, screening, query and segment lifecycle through the
//! public API.

mod common;

use common::*;
use std::sync::Arc;

use decision_ledger::ledger::{
    verify_segment_file, CallerContext, CandidateRecord, Decision, Outcome, QueryFilter,
    VerificationResult,
};
use decision_ledger::{Ledger, LedgerError, LedgerOptions, LedgerState};

#[tokio::test]
async fn test_appended_chain_verifies() {
    let (_dir, path) = temp_segment();
    let ledger = ledger_with_records(&path, 10).await;

    assert_eq!(ledger.tip().sequence_number, 10);
    assert_eq!(ledger.verify(1, 10).unwrap(), VerificationResult::Intact);
    assert_eq!(ledger.verify(4, 7).unwrap(), VerificationResult::Intact);
    assert_eq!(ledger.verify_all().unwrap(), VerificationResult::Intact);
    assert!(matches!(
        ledger.verify(3, 11),
        Err(LedgerError::InvalidRange { from: 3, to: 11 })
    ));
    assert!(matches!(
        ledger.verify(0, 2),
        Err(LedgerError::InvalidRange { .. })
    ));
}

#[tokio::test]
async fn test_out_of_band_edit_is_detected_while_open() {
    let (_dir, path) = temp_segment();
    let ledger = ledger_with_records(&path, 5).await;

    rewrite_record_line(&path, 3, |line| {
        line.replace("\"outcome\":\"allow\"", "\"outcome\":\"block\"")
    });

    assert_eq!(ledger.verify(1, 5).unwrap(), VerificationResult::Tampered(3));
    assert_eq!(ledger.verify(3, 3).unwrap(), VerificationResult::Tampered(3));
    assert_eq!(ledger.verify(1, 2).unwrap(), VerificationResult::Intact);
}

#[tokio::test]
async fn test_out_of_band_edit_is_detected_after_reopen() {
    let (_dir, path) = temp_segment();
    drop(ledger_with_records(&path, 5).await);

    rewrite_record_line(&path, 2, |line| {
        line.replace("\"caller_identity\":\"role:service\"", "\"caller_identity\":\"role:admin\"")
    });

    let reopened = Ledger::open(&path, LedgerOptions::default()).unwrap();
    assert_eq!(reopened.verify(1, 5).unwrap(), VerificationResult::Tampered(2));
    assert_eq!(
        verify_segment_file(&path, None, None).unwrap(),
        VerificationResult::Tampered(2)
    );
}

#[tokio::test]
async fn test_deleted_record_is_detected() {
    let (_dir, path) = temp_segment();
    drop(ledger_with_records(&path, 5).await);

    delete_record_line(&path, 3);

    assert_eq!(
        verify_segment_file(&path, None, None).unwrap(),
        VerificationResult::Tampered(3)
    );
}

#[tokio::test]
async fn test_rehashed_record_still_breaks_the_chain() {
    let (_dir, path) = temp_segment();
    let ledger = ledger_with_records(&path, 4).await;

    let mut record = ledger
        .query(QueryFilter::new().sequence_range(2, 2))
        .next()
        .unwrap()
        .unwrap();
    let original = serde_json::to_string(&record).unwrap();
    record.decision_output.outcome = Outcome::Block;
    record.record_hash = record.compute_hash(ledger.header().algorithm).unwrap();
    let forged = serde_json::to_string(&record).unwrap();

    // Same length, so the in-memory index still lines up.
    assert_eq!(original.len(), forged.len());
    rewrite_record_line(&path, 2, |line| line.replace(&original[1..], &forged[1..]));

    assert_eq!(ledger.verify(1, 4).unwrap(), VerificationResult::Tampered(3));
}

#[tokio::test]
async fn test_full_precision_confidence_verifies_and_reopens() {
    let (_dir, path) = temp_segment();
    let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();

    for (i, confidence) in [0.9856906946328695, 0.30000000000000004, 0.7071067811865476]
        .into_iter()
        .enumerate()
    {
        let mut candidate = candidate(i as u64 + 1);
        candidate.decision.confidence = confidence;
        ledger.append(candidate).await.unwrap();
    }
    assert_eq!(ledger.verify_all().unwrap(), VerificationResult::Intact);
    let tip = ledger.tip();
    drop(ledger);

    let reopened = Ledger::open(&path, LedgerOptions::default()).unwrap();
    assert_eq!(reopened.tip(), tip);
    assert_eq!(reopened.verify(1, 3).unwrap(), VerificationResult::Intact);
    let first = reopened.query(QueryFilter::new()).next().unwrap().unwrap();
    assert_eq!(first.decision_output.confidence, 0.9856906946328695);
}

#[tokio::test]
async fn test_timestamps_never_go_backwards() {
    let (_dir, path) = temp_segment();
    let clock = ManualClock::new();
    let options = LedgerOptions::default().with_clock(clock.clone());
    let ledger = Ledger::open(&path, options).unwrap();

    ledger.append(candidate(1)).await.unwrap();
    clock.advance(-3600);
    ledger.append(candidate(2)).await.unwrap();
    clock.advance(7200);
    ledger.append(candidate(3)).await.unwrap();

    let records: Vec<_> = ledger
        .query(QueryFilter::new())
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records[1].timestamp, records[0].timestamp);
    assert!(records[2].timestamp > records[1].timestamp);
    assert!(ledger.verify_all().unwrap().is_intact());
}

#[tokio::test]
async fn test_card_shaped_values_are_rejected_in_any_field() {
    let (_dir, path) = temp_segment();
    let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();

    for value in [
        "card 4111111111111111 5 tries",
        "1234567812345678",
        "1234 5678 9012 3456",
    ] {
        let mut leaky = candidate(1);
        leaky.caller.trace_id = value.to_string();
        assert!(
            matches!(
                ledger.append(leaky).await,
                Err(LedgerError::SensitiveDataRejected { ref field, ref pattern })
                    if field == "trace_id" && pattern == "card_number"
            ),
            "{}",
            value
        );
    }

    assert_eq!(ledger.tip().sequence_number, 0);
    assert_eq!(ledger.query(QueryFilter::new()).count(), 0);
}

#[tokio::test]
async fn test_unknown_candidate_keys_are_rejected() {
    let json = r#"{"caller_identity":"role:service","request_id":"req-1","trace_id":"t-1",
        "outcome":"allow","confidence":0.2,"model_version":"v1","schema_version":"s1",
        "pan":"4111111111111111"}"#;
    assert!(matches!(
        CandidateRecord::from_json(json),
        Err(LedgerError::InvalidRecord(_))
    ));
}

#[tokio::test]
async fn test_card_number_is_rejected_and_not_persisted() {
    let (_dir, path) = temp_segment();
    let ledger = ledger_with_records(&path, 2).await;
    let len_before = std::fs::metadata(&path).unwrap().len();

    let leaky = CandidateRecord::new(
        CallerContext::new("role:service", "req-leak", "trace-leak"),
        Decision::new(Outcome::Block, 0.9, "v1-placeholder", "features-v3")
            .with_reasons(vec!["card 4111111111111111 on watchlist".to_string()]),
    );
    let err = ledger.append(leaky).await.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::SensitiveDataRejected { ref field, ref pattern }
            if field == "reasons" && pattern == "card_number"
    ));
    assert!(!err.to_string().contains("4111111111111111"));

    assert_eq!(ledger.tip().sequence_number, 2);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);
    assert_eq!(
        ledger
            .query(QueryFilter::new().request_id("req-leak"))
            .count(),
        0
    );
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(!contents.contains("4111111111111111"));
}

#[tokio::test]
async fn test_hashed_subject_is_accepted() {
    let (_dir, path) = temp_segment();
    let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();

    let caller = CallerContext::with_hashed_subject("jane@example.com", "salt", "req-1", "trace-1");
    assert!(caller.caller_identity.starts_with("sub:"));
    let candidate = CandidateRecord::new(
        caller.clone(),
        Decision::new(Outcome::Review, 0.5, "v1-placeholder", "features-v3"),
    );
    assert_eq!(ledger.append(candidate).await.unwrap(), 1);

    let raw = CandidateRecord::new(
        CallerContext::new("jane@example.com", "req-2", "trace-2"),
        Decision::new(Outcome::Review, 0.5, "v1-placeholder", "features-v3"),
    );
    assert!(matches!(
        ledger.append(raw).await,
        Err(LedgerError::SensitiveDataRejected { .. })
    ));
}

#[tokio::test]
async fn test_invalid_candidates_write_nothing() {
    let (_dir, path) = temp_segment();
    let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();

    let mut bad_confidence = candidate(1);
    bad_confidence.decision.confidence = 1.5;
    assert!(matches!(
        ledger.append(bad_confidence).await,
        Err(LedgerError::InvalidRecord(_))
    ));

    let mut no_model = candidate(1);
    no_model.decision.model_version = String::new();
    assert!(matches!(
        ledger.append(no_model).await,
        Err(LedgerError::InvalidRecord(_))
    ));

    assert!(matches!(
        CandidateRecord::from_json(r#"{"caller_identity":"role:service","outcome":"maybe"}"#),
        Err(LedgerError::InvalidRecord(_))
    ));

    assert_eq!(ledger.tip().sequence_number, 0);
    assert_eq!(ledger.append(candidate(1)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_query_filters_and_restart() {
    let (_dir, path) = temp_segment();
    let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();
    for i in 1..=6 {
        let model = if i % 2 == 0 { "v2" } else { "v1" };
        ledger.append(candidate_with(i, Outcome::Review, model)).await.unwrap();
    }

    let v2: Vec<u64> = ledger
        .query(QueryFilter::new().model_version("v2"))
        .map(|r| r.unwrap().sequence_number)
        .collect();
    assert_eq!(v2, vec![2, 4, 6]);

    let by_request: Vec<_> = ledger
        .query(QueryFilter::new().request_id("req-0005"))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(by_request.len(), 1);
    assert_eq!(by_request[0].sequence_number, 5);

    let mut ranged = ledger.query(QueryFilter::new().sequence_range(2, 4).model_version("v1"));
    let first_pass: Vec<u64> = ranged.by_ref().map(|r| r.unwrap().sequence_number).collect();
    assert_eq!(first_pass, vec![3]);
    ranged.restart();
    let second_pass: Vec<u64> = ranged.map(|r| r.unwrap().sequence_number).collect();
    assert_eq!(second_pass, first_pass);

    // Streams stop at the tip they were created at.
    let stream = ledger.query(QueryFilter::new());
    ledger.append(candidate(7)).await.unwrap();
    assert_eq!(stream.count(), 6);
}

#[tokio::test]
async fn test_query_time_window() {
    let (_dir, path) = temp_segment();
    let clock = ManualClock::new();
    let ledger = Ledger::open(&path, LedgerOptions::default().with_clock(clock.clone())).unwrap();
    for i in 1..=5 {
        ledger.append(candidate(i)).await.unwrap();
        clock.advance(60);
    }

    let records: Vec<_> = ledger
        .query(QueryFilter::new())
        .collect::<Result<_, _>>()
        .unwrap();
    let window = QueryFilter::new().time_range(Some(records[1].timestamp), Some(records[3].timestamp));
    let hits: Vec<u64> = ledger
        .query(window)
        .map(|r| r.unwrap().sequence_number)
        .collect();
    assert_eq!(hits, vec![2, 3, 4]);
}

#[tokio::test]
async fn test_seal_and_successor_continue_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let first_path = dir.path().join("segment-0001.jsonl");
    let next_path = dir.path().join("segment-0002.jsonl");

    let ledger = ledger_with_records(&first_path, 5).await;
    let receipt = ledger.seal().await.unwrap();
    assert_eq!(receipt.last_sequence, 5);
    assert_eq!(receipt.record_count, 5);
    assert_eq!(receipt.merkle_root, Some(ledger.merkle_root(1, 5).unwrap()));
    assert_eq!(ledger.state(), LedgerState::Sealed);

    assert!(matches!(
        ledger.append(candidate(6)).await,
        Err(LedgerError::SealedLedgerWriteAttempt { segment_id: 1 })
    ));
    assert_eq!(ledger.verify(1, 5).unwrap(), VerificationResult::Intact);

    // Sealed takes precedence over validation and screening.
    let mut invalid = candidate(6);
    invalid.decision.confidence = 2.0;
    assert!(matches!(
        ledger.append(invalid).await,
        Err(LedgerError::SealedLedgerWriteAttempt { segment_id: 1 })
    ));
    let mut leaky = candidate(6);
    leaky.caller.trace_id = "4111111111111111".to_string();
    assert!(matches!(
        ledger.append(leaky).await,
        Err(LedgerError::SealedLedgerWriteAttempt { segment_id: 1 })
    ));

    let successor = Ledger::open_successor(&next_path, &receipt, LedgerOptions::default()).unwrap();
    assert_eq!(successor.header().segment_id, 2);
    assert_eq!(successor.append(candidate(6)).await.unwrap(), 6);

    let record = successor
        .query(QueryFilter::new())
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(record.prev_hash, receipt.final_hash);
    assert_eq!(successor.verify(6, 6).unwrap(), VerificationResult::Intact);
    assert!(matches!(
        successor.verify(5, 6),
        Err(LedgerError::InvalidRange { .. })
    ));

    // Reopening the successor with the same receipt resumes it.
    drop(successor);
    let resumed = Ledger::open_successor(&next_path, &receipt, LedgerOptions::default()).unwrap();
    assert_eq!(resumed.tip().sequence_number, 6);
}

#[tokio::test]
async fn test_successor_timestamps_follow_sealed_segment() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let options = LedgerOptions::default().with_clock(clock.clone());

    let ledger = Ledger::open(dir.path().join("a.jsonl"), options.clone()).unwrap();
    ledger.append(candidate(1)).await.unwrap();
    let receipt = ledger.seal().await.unwrap();

    clock.advance(-600);
    let successor = Ledger::open_successor(dir.path().join("b.jsonl"), &receipt, options).unwrap();
    successor.append(candidate(2)).await.unwrap();
    let record = successor.query(QueryFilter::new()).next().unwrap().unwrap();
    assert_eq!(Some(record.timestamp), receipt.last_timestamp);
}

#[tokio::test]
async fn test_successor_rejects_unrelated_segment() {
    let dir = tempfile::tempdir().unwrap();
    let sealed = ledger_with_records(&dir.path().join("a.jsonl"), 2).await;
    let receipt = sealed.seal().await.unwrap();

    let unrelated = dir.path().join("b.jsonl");
    drop(ledger_with_records(&unrelated, 1).await);

    assert!(matches!(
        Ledger::open_successor(&unrelated, &receipt, LedgerOptions::default()),
        Err(LedgerError::MalformedSegment(_))
    ));
}

#[tokio::test]
async fn test_clones_share_state() {
    let (_dir, path) = temp_segment();
    let ledger = Ledger::open(&path, LedgerOptions::default()).unwrap();
    let clone = ledger.clone();

    clone.append(candidate(1)).await.unwrap();
    assert_eq!(ledger.tip().sequence_number, 1);

    let shared = Arc::new(ledger);
    assert_eq!(shared.append(candidate(2)).await.unwrap(), 2);
    assert_eq!(clone.tip().sequence_number, 2);
}
