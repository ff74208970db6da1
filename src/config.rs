use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::LedgerError;
use crate::ledger::hash::HashAlgorithm;
use crate::ledger::pii::{default_patterns, PiiDenylist, PiiPatternConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_segment_path")]
    pub segment_path: PathBuf,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    #[serde(default = "default_sync_on_append")]
    pub sync_on_append: bool,
    #[serde(default = "default_patterns")]
    pub pii_patterns: Vec<PiiPatternConfig>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_segment_path() -> PathBuf {
    PathBuf::from("logs/decision-ledger.jsonl")
}

fn default_sync_on_append() -> bool {
    true
}

fn default_log_filter() -> String {
    "decision_ledger=info".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            segment_path: default_segment_path(),
            hash_algorithm: HashAlgorithm::default(),
            sync_on_append: default_sync_on_append(),
            pii_patterns: default_patterns(),
            log_filter: default_log_filter(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration: built-in defaults, then `file` if given, then
    /// `LEDGER_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, LedgerError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            info!("Loading ledger configuration from: {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("LEDGER").try_parsing(true));

        let config: LedgerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.segment_path.as_os_str().is_empty() {
            return Err(LedgerError::ConfigError("segment_path must not be empty".to_string()));
        }
        self.denylist()?;
        Ok(())
    }

    pub fn denylist(&self) -> Result<PiiDenylist, LedgerError> {
        PiiDenylist::new(&self.pii_patterns)
    }
}
