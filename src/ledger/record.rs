//! Decision Records
//!
//! Defines the business inputs handed to the ledger and the immutable,
//! hash-chained record the ledger produces from them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;
use crate::ledger::hash::HashAlgorithm;

/// Upper bound for any single string field, in bytes.
pub const MAX_FIELD_LEN: usize = 256;
/// Upper bound for the number of reason codes on one decision.
pub const MAX_REASONS: usize = 32;

/// Recommended action produced by the scoring policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allow,
    Review,
    Block,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Review => "review",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "review" => Ok(Self::Review),
            "block" => Ok(Self::Block),
            other => Err(LedgerError::invalid_record(format!(
                "Unrecognized outcome '{}': expected allow, review or block",
                other
            ))),
        }
    }
}

/// Outcome plus the model's confidence in it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub outcome: Outcome,
    pub confidence: f64,
}

/// What the inference component decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub confidence: f64,
    pub model_version: String,
    pub schema_version: String,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub rules_version: Option<String>,
}

impl Decision {
    pub fn new(
        outcome: Outcome,
        confidence: f64,
        model_version: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            outcome,
            confidence,
            model_version: model_version.into(),
            schema_version: schema_version.into(),
            reasons: Vec::new(),
            rules_version: None,
        }
    }

    pub fn with_reasons(mut self, reasons: Vec<String>) -> Self {
        self.reasons = reasons;
        self
    }

    pub fn with_rules_version(mut self, rules_version: impl Into<String>) -> Self {
        self.rules_version = Some(rules_version.into());
        self
    }
}

/// Who asked, as reported by the identity component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub caller_identity: String,
    pub request_id: String,
    pub trace_id: String,
}

impl CallerContext {
    pub fn new(
        caller_identity: impl Into<String>,
        request_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            caller_identity: caller_identity.into(),
            request_id: request_id.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Build a context whose identity is a salted hash of `subject`, so the
    /// raw subject id never reaches the ledger.
    pub fn with_hashed_subject(
        subject: &str,
        salt: &str,
        request_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(b":");
        hasher.update(subject.as_bytes());
        let caller_identity = format!("sub:{}", hex::encode(hasher.finalize()));
        Self::new(caller_identity, request_id, trace_id)
    }
}

/// Business fields submitted for append; the ledger fills in the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(flatten)]
    pub caller: CallerContext,
    #[serde(flatten)]
    pub decision: Decision,
}

impl CandidateRecord {
    pub fn new(caller: CallerContext, decision: Decision) -> Self {
        Self { caller, decision }
    }

    /// Parse an untyped candidate. Any shape error, including an unknown
    /// outcome value or an unexpected key, is an `InvalidRecord`.
    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        serde_json::from_str::<CandidateJson>(json)
            .map(Self::from)
            .map_err(|e| LedgerError::invalid_record(format!("Malformed candidate: {}", e)))
    }

    /// Check business-field constraints. Does not look for PII.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let confidence = self.decision.confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(LedgerError::invalid_record(format!(
                "Confidence {} outside [0.0, 1.0]",
                confidence
            )));
        }

        for (field, value) in [
            ("caller_identity", &self.caller.caller_identity),
            ("request_id", &self.caller.request_id),
            ("model_version", &self.decision.model_version),
            ("schema_version", &self.decision.schema_version),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::invalid_record(format!("{} must not be empty", field)));
            }
        }

        if self.decision.reasons.len() > MAX_REASONS {
            return Err(LedgerError::invalid_record(format!(
                "Too many reason codes: {} (maximum {})",
                self.decision.reasons.len(),
                MAX_REASONS
            )));
        }

        for (field, value) in self.string_fields() {
            if value.len() > MAX_FIELD_LEN {
                return Err(LedgerError::invalid_record(format!(
                    "{} exceeds {} bytes",
                    field, MAX_FIELD_LEN
                )));
            }
        }

        Ok(())
    }

    /// Every caller-supplied string, labelled with its field name.
    pub fn string_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![
            ("caller_identity", self.caller.caller_identity.as_str()),
            ("request_id", self.caller.request_id.as_str()),
            ("trace_id", self.caller.trace_id.as_str()),
            ("model_version", self.decision.model_version.as_str()),
            ("schema_version", self.decision.schema_version.as_str()),
        ];
        if let Some(rules_version) = &self.decision.rules_version {
            fields.push(("rules_version", rules_version.as_str()));
        }
        for reason in &self.decision.reasons {
            fields.push(("reasons", reason.as_str()));
        }
        fields
    }
}

/// Flat wire form of a candidate; unknown keys are rejected.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CandidateJson {
    caller_identity: String,
    request_id: String,
    trace_id: String,
    outcome: Outcome,
    confidence: f64,
    model_version: String,
    schema_version: String,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    rules_version: Option<String>,
}

impl From<CandidateJson> for CandidateRecord {
    fn from(json: CandidateJson) -> Self {
        Self {
            caller: CallerContext {
                caller_identity: json.caller_identity,
                request_id: json.request_id,
                trace_id: json.trace_id,
            },
            decision: Decision {
                outcome: json.outcome,
                confidence: json.confidence,
                model_version: json.model_version,
                schema_version: json.schema_version,
                reasons: json.reasons,
                rules_version: json.rules_version,
            },
        }
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub sequence_number: u64,
    pub request_id: String,
    pub trace_id: String,
    pub caller_identity: String,
    pub model_version: String,
    pub schema_version: String,
    pub decision_output: DecisionOutput,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub record_hash: String,
}

/// Fixed field order used for hashing. Excludes both hashes.
#[derive(Serialize)]
struct CanonicalView<'a> {
    sequence_number: u64,
    request_id: &'a str,
    trace_id: &'a str,
    caller_identity: &'a str,
    model_version: &'a str,
    schema_version: &'a str,
    outcome: Outcome,
    confidence: f64,
    reasons: &'a [String],
    rules_version: Option<&'a str>,
    timestamp: String,
}

impl DecisionRecord {
    /// Build the record for `candidate` at the given chain position and
    /// compute its hash.
    pub fn link(
        candidate: CandidateRecord,
        sequence_number: u64,
        timestamp: DateTime<Utc>,
        prev_hash: String,
        algorithm: HashAlgorithm,
    ) -> Result<Self, LedgerError> {
        let CandidateRecord { caller, decision } = candidate;
        let mut record = Self {
            sequence_number,
            request_id: caller.request_id,
            trace_id: caller.trace_id,
            caller_identity: caller.caller_identity,
            model_version: decision.model_version,
            schema_version: decision.schema_version,
            decision_output: DecisionOutput {
                outcome: decision.outcome,
                confidence: decision.confidence,
            },
            reasons: decision.reasons,
            rules_version: decision.rules_version,
            timestamp,
            prev_hash,
            record_hash: String::new(),
        };
        record.record_hash = record.compute_hash(algorithm)?;
        Ok(record)
    }

    /// Canonical serialization of every field except `prev_hash` and
    /// `record_hash`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        let view = CanonicalView {
            sequence_number: self.sequence_number,
            request_id: &self.request_id,
            trace_id: &self.trace_id,
            caller_identity: &self.caller_identity,
            model_version: &self.model_version,
            schema_version: &self.schema_version,
            outcome: self.decision_output.outcome,
            confidence: self.decision_output.confidence,
            reasons: &self.reasons,
            rules_version: self.rules_version.as_deref(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// `H(canonical_bytes ∥ prev_hash)`
    pub fn compute_hash(&self, algorithm: HashAlgorithm) -> Result<String, LedgerError> {
        let canonical = self.canonical_bytes()?;
        Ok(algorithm.digest(&[&canonical, self.prev_hash.as_bytes()]))
    }

    /// Whether the stored `record_hash` matches the record's contents.
    pub fn verify_hash(&self, algorithm: HashAlgorithm) -> bool {
        self.compute_hash(algorithm)
            .map(|hash| hash == self.record_hash)
            .unwrap_or(false)
    }

    pub fn summary(&self) -> String {
        format!(
            "#{} {} ({:.3}) model {} request {}",
            self.sequence_number,
            self.decision_output.outcome,
            self.decision_output.confidence,
            self.model_version,
            self.request_id
        )
    }
}
