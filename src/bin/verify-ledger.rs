use anyhow::{anyhow, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use std::path::Path;
use tracing::{error, info};

use decision_ledger::ledger::merkle::merkle_root;
use decision_ledger::ledger::store::scan_segment;
use decision_ledger::ledger::{query_segment_file, verify_segment_file, QueryFilter, VerificationResult};

fn main() {
    let matches = Command::new("verify-ledger")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify decision ledger segment integrity without modifying it")
        .arg(
            Arg::new("segment")
                .short('s')
                .long("segment")
                .value_name("PATH")
                .help("Path to segment file")
                .required(true),
        )
        .arg(
            Arg::new("from")
                .long("from")
                .value_name("SEQ")
                .help("First sequence number to verify")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("to")
                .long("to")
                .value_name("SEQ")
                .help("Last sequence number to verify")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("merkle-root")
                .short('m')
                .long("merkle-root")
                .value_name("HASH")
                .help("Expected Merkle root over the verified range"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .conflicts_with("verbose")
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let segment = matches
        .get_one::<String>("segment")
        .map(String::as_str)
        .unwrap_or_default();
    let from = matches.get_one::<u64>("from").copied();
    let to = matches.get_one::<u64>("to").copied();
    let expected_merkle_root = matches.get_one::<String>("merkle-root");

    if let Err(e) = verify_ledger_file(Path::new(segment), from, to, expected_merkle_root, verbose) {
        error!("Ledger verification failed: {}", e);
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Ledger verification completed successfully");
    }
}

fn verify_ledger_file(
    path: &Path,
    from: Option<u64>,
    to: Option<u64>,
    expected_merkle_root: Option<&String>,
    verbose: bool,
) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("Segment file not found: {}", path.display()));
    }

    let scan = scan_segment(path)?;
    let header = scan
        .header
        .clone()
        .ok_or_else(|| anyhow!("Segment has no header: {}", path.display()))?;
    let record_count = scan.offsets.len() as u64;

    if verbose {
        println!(
            "Segment {} (first sequence {}, {}): {} records",
            header.segment_id, header.first_sequence, header.algorithm, record_count
        );
        if scan.torn_bytes > 0 {
            println!("⚠ {} bytes of interrupted write at end of file", scan.torn_bytes);
        }
    }

    info!("Verifying hash chain integrity");
    let result = verify_segment_file(path, from, to)?;
    if let VerificationResult::Tampered(sequence) = result {
        return Err(anyhow!("Hash chain broken at sequence {}", sequence));
    }
    if verbose {
        println!("{}", result.summary());
    }

    let filter = QueryFilter {
        from_sequence: from,
        to_sequence: to,
        ..QueryFilter::default()
    };
    let hashes = query_segment_file(path, filter)?
        .map(|record| record.map(|r| r.record_hash))
        .collect::<Result<Vec<_>, _>>()?;
    let root = merkle_root(&hashes, header.algorithm);

    if let Some(expected) = expected_merkle_root {
        info!("Verifying Merkle root against expected value");
        let root = root
            .as_ref()
            .ok_or_else(|| anyhow!("No records to compute a Merkle root over"))?;
        if root != expected {
            return Err(anyhow!(
                "Merkle root mismatch. Expected: {}, Got: {}",
                expected,
                root
            ));
        }
        if verbose {
            println!("✓ Merkle root matches expected value");
        }
    }

    if let Some(seal) = &scan.seal {
        let last_hash = scan
            .last
            .as_ref()
            .and_then(|slot| slot.record())
            .map(|record| record.record_hash.as_str())
            .unwrap_or(header.seed_hash.as_str());
        let last_sequence = (header.first_sequence + record_count).saturating_sub(1);
        if seal.last_sequence != last_sequence || seal.final_hash != last_hash {
            return Err(anyhow!(
                "Seal does not match segment tail (sealed at {}, tail at {})",
                seal.last_sequence,
                last_sequence
            ));
        }
        if from.is_none() && to.is_none() && seal.merkle_root != root {
            return Err(anyhow!("Seal Merkle root does not match segment records"));
        }
        if verbose {
            println!("✓ {}", seal.summary());
        }
    }

    if verbose {
        println!("\nLedger Summary:");
        println!("  Records: {}", record_count);
        if let Some(root) = &root {
            println!("  Merkle root: {}", root);
        }
        println!(
            "  State: {}",
            if scan.seal.is_some() { "sealed" } else { "open" }
        );
    }

    Ok(())
}
