use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use decision_ledger::ledger::{CallerContext, CandidateRecord, Decision, Outcome, QueryFilter};
use decision_ledger::{Ledger, LedgerConfig, LedgerOptions};

#[derive(Parser)]
#[command(name = "decision-ledger")]
#[command(about = "Operate the tamper-evident fraud decision ledger")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Segment file to operate on, overriding the configured path
    #[arg(short, long, global = true)]
    segment: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a single decision record
    Append {
        /// Caller identity (e.g. role:service)
        #[arg(long)]
        caller: String,

        /// Correlation id; a random UUID is used when omitted
        #[arg(long)]
        request_id: Option<String>,

        #[arg(long)]
        trace_id: Option<String>,

        /// allow, review or block
        #[arg(long)]
        outcome: String,

        #[arg(long)]
        confidence: f64,

        #[arg(long)]
        model_version: String,

        #[arg(long)]
        schema_version: String,

        /// Reason code; repeat for several
        #[arg(long = "reason")]
        reasons: Vec<String>,

        #[arg(long)]
        rules_version: Option<String>,
    },
    /// Append candidate records read as JSON lines
    Import {
        /// Input file; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print matching records as JSON lines
    Query {
        #[arg(long)]
        from: Option<u64>,

        #[arg(long)]
        to: Option<u64>,

        #[arg(long)]
        caller: Option<String>,

        #[arg(long)]
        model_version: Option<String>,

        #[arg(long)]
        request_id: Option<String>,

        /// RFC 3339 lower bound on capture time
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// RFC 3339 upper bound on capture time
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
    /// Recompute the hash chain
    Verify {
        #[arg(long)]
        from: Option<u64>,

        #[arg(long)]
        to: Option<u64>,
    },
    /// Seal the segment against further appends
    Seal,
    /// Seal the segment and open its successor
    Rotate {
        /// Path of the successor segment
        #[arg(short, long)]
        next: PathBuf,
    },
    /// Re-derive the tip from the segment on disk
    Recover,
    /// Show segment header, tip and seal
    Status,
    /// Print a Merkle inclusion proof for one record
    Proof {
        #[arg(long)]
        sequence: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LedgerConfig::load(cli.config.as_deref())?;
    if let Some(segment) = cli.segment {
        config.segment_path = segment;
    }

    // stdout carries command output; logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let options = LedgerOptions::from_config(&config)?;
    let ledger = Ledger::open(&config.segment_path, options.clone())
        .with_context(|| format!("Failed to open ledger at {}", config.segment_path.display()))?;

    match cli.command {
        Commands::Append {
            caller,
            request_id,
            trace_id,
            outcome,
            confidence,
            model_version,
            schema_version,
            reasons,
            rules_version,
        } => {
            let outcome: Outcome = outcome.parse()?;
            let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let trace_id = trace_id.unwrap_or_else(|| request_id.clone());

            let mut decision = Decision::new(outcome, confidence, model_version, schema_version)
                .with_reasons(reasons);
            if let Some(rules_version) = rules_version {
                decision = decision.with_rules_version(rules_version);
            }
            let caller = CallerContext::new(caller, request_id.clone(), trace_id);

            let sequence_number = ledger.append(CandidateRecord::new(caller, decision)).await?;
            println!(
                "{}",
                json!({ "sequence_number": sequence_number, "request_id": request_id })
            );
        }
        Commands::Import { file } => import(&ledger, file).await?,
        Commands::Query {
            from,
            to,
            caller,
            model_version,
            request_id,
            since,
            until,
        } => {
            let filter = QueryFilter {
                from_sequence: from,
                to_sequence: to,
                caller_identity: caller,
                model_version,
                request_id,
                since,
                until,
            };

            let stdout = io::stdout();
            let mut out = stdout.lock();
            for record in ledger.query(filter) {
                writeln!(out, "{}", serde_json::to_string(&record?)?)?;
            }
        }
        Commands::Verify { from, to } => {
            let result = match (from, to) {
                (None, None) => ledger.verify_all()?,
                _ => ledger.verify(
                    from.unwrap_or(ledger.header().first_sequence),
                    to.unwrap_or(ledger.tip().sequence_number),
                )?,
            };
            println!("{}", result.summary());
            if !result.is_intact() {
                std::process::exit(1);
            }
        }
        Commands::Seal => {
            let receipt = ledger.seal().await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Rotate { next } => {
            let receipt = ledger.seal().await?;
            let successor = Ledger::open_successor(&next, &receipt, options)?;
            info!(
                "Rotated from {} to {}",
                ledger.path().display(),
                successor.path().display()
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "sealed": receipt,
                    "successor": successor.header(),
                    "successor_path": successor.path(),
                }))?
            );
        }
        Commands::Recover => {
            let tip = ledger.recover().await?;
            println!("{}", serde_json::to_string_pretty(&tip)?);
        }
        Commands::Status => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "path": ledger.path(),
                    "header": ledger.header(),
                    "state": ledger.state(),
                    "tip": ledger.tip(),
                    "seal": ledger.seal_receipt(),
                }))?
            );
        }
        Commands::Proof { sequence } => {
            let proof = ledger.inclusion_proof(sequence)?;
            println!("{}", serde_json::to_string_pretty(&proof)?);
        }
    }

    Ok(())
}

/// Append every candidate in a JSON-lines stream. Rejected candidates are
/// logged and skipped; a storage failure stops the import.
async fn import(ledger: &Ledger, file: Option<PathBuf>) -> Result<()> {
    let reader: Box<dyn BufRead> = match file {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut appended = 0usize;
    let mut rejected = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let result = match CandidateRecord::from_json(&line) {
            Ok(candidate) => ledger.append(candidate).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(sequence_number) => {
                appended += 1;
                println!(
                    "{}",
                    json!({ "line": index + 1, "sequence_number": sequence_number })
                );
            }
            Err(e) if e.is_retryable() => {
                return Err(anyhow!("Import stopped at line {}: {}", index + 1, e));
            }
            Err(e) => {
                rejected += 1;
                error!("Rejected line {}: {}", index + 1, e);
            }
        }
    }

    info!("Imported {} records, rejected {}", appended, rejected);
    Ok(())
}
