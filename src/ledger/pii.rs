//! PII Denylist
//!
//! Scans caller-supplied strings for PII-shaped values before they can
//! reach the ledger. Matches are rejected outright; values are never
//! redacted in place or written anywhere.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::LedgerError;
use crate::ledger::record::CandidateRecord;

/// Tracing target for operational (non-audit) events.
pub const OPS_TARGET: &str = "decision_ledger::ops";

/// One configured denylist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiPatternConfig {
    pub name: String,
    pub pattern: String,
    /// Only count a match when some run of 13 to 19 of its digits passes
    /// the Luhn checksum.
    #[serde(default)]
    pub luhn_check: bool,
}

impl PiiPatternConfig {
    pub fn new(name: &str, pattern: &str, luhn_check: bool) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            luhn_check,
        }
    }
}

/// Built-in patterns: card-number-shaped digit runs (13 or more digits,
/// spaces and dashes allowed), email addresses, SSN-shaped ids.
pub fn default_patterns() -> Vec<PiiPatternConfig> {
    vec![
        PiiPatternConfig::new("card_number", r"\b(?:\d[ -]?){12,}\d\b", false),
        PiiPatternConfig::new(
            "email",
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            false,
        ),
        PiiPatternConfig::new("national_id", r"\b\d{3}-\d{2}-\d{4}\b", false),
    ]
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    name: String,
    regex: Regex,
    luhn_check: bool,
}

impl CompiledPattern {
    fn is_match(&self, value: &str) -> bool {
        if !self.luhn_check {
            return self.regex.is_match(value);
        }
        self.regex
            .find_iter(value)
            .any(|m| contains_luhn_window(m.as_str()))
    }
}

/// Compiled set of PII patterns.
#[derive(Debug, Clone, Default)]
pub struct PiiDenylist {
    patterns: Vec<CompiledPattern>,
}

impl PiiDenylist {
    pub fn new(configs: &[PiiPatternConfig]) -> Result<Self, LedgerError> {
        let mut patterns = Vec::with_capacity(configs.len());
        for config in configs {
            if patterns
                .iter()
                .any(|p: &CompiledPattern| p.name == config.name)
            {
                return Err(LedgerError::ConfigError(format!(
                    "Duplicate PII pattern name: {}",
                    config.name
                )));
            }
            patterns.push(CompiledPattern {
                name: config.name.clone(),
                regex: Regex::new(&config.pattern)?,
                luhn_check: config.luhn_check,
            });
        }
        Ok(Self { patterns })
    }

    /// Denylist built from [`default_patterns`].
    pub fn standard() -> Self {
        Self::new(&default_patterns()).expect("built-in PII patterns compile")
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Name of the first pattern matching `value`, if any.
    pub fn scan(&self, value: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.is_match(value))
            .map(|p| p.name.as_str())
    }

    /// Reject `candidate` if any of its string fields looks like PII.
    pub fn check(&self, candidate: &CandidateRecord) -> Result<(), LedgerError> {
        for (field, value) in candidate.string_fields() {
            if let Some(pattern) = self.scan(value) {
                warn!(
                    target: OPS_TARGET,
                    field,
                    pattern,
                    "Rejected decision record containing PII-shaped value"
                );
                return Err(LedgerError::SensitiveDataRejected {
                    field: field.to_string(),
                    pattern: pattern.to_string(),
                });
            }
        }
        Ok(())
    }
}

const CARD_DIGITS_MIN: usize = 13;
const CARD_DIGITS_MAX: usize = 19;

/// Whether any contiguous run of card-length digits in `matched` passes
/// Luhn. Separators are ignored.
fn contains_luhn_window(matched: &str) -> bool {
    let digits: Vec<u32> = matched.chars().filter_map(|c| c.to_digit(10)).collect();
    (0..digits.len()).any(|start| {
        (CARD_DIGITS_MIN..=CARD_DIGITS_MAX)
            .take_while(|len| start + len <= digits.len())
            .any(|len| luhn_valid(&digits[start..start + len]))
    })
}

fn luhn_valid(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
