// ABOUTME: Batch migration CLI that moves external recipe images into the local store.
// ABOUTME: Reads JSON records from a file or stdin, migrates with bounded concurrency, prints a JSON envelope.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use pantry_courier::cli::{init_tracing, ConfigArgs};
use pantry_courier::{EntityId, MigrationOutcome, Migrator, MigratorBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Migrate externally hosted images for a batch of records and output JSON.
#[derive(Parser, Debug)]
#[command(name = "pantry-cli")]
#[command(about = "Migrate external recipe images to local storage and print JSON", long_about = None)]
struct Args {
    /// JSON file holding an array of {"id", "image_url"} records. Use "-" for stdin.
    input: String,

    /// Maximum migrations in flight at once.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Output compact JSON instead of pretty.
    #[arg(long, default_value_t = false)]
    compact: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Clone, Deserialize)]
struct Record {
    id: u64,
    image_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecordResult {
    id: u64,
    /// Value to keep for the record after this run.
    image_url: Option<String>,
    #[serde(flatten)]
    outcome: MigrationOutcome,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if args.concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let records = load_records(&args.input)?;
    let migrator = MigratorBuilder::from_options(args.config.to_options())
        .build()
        .map_err(anyhow::Error::new)?;

    let results = migrate_all(&migrator, records, args.concurrency).await;

    let migrated = results.iter().filter(|r| r.outcome.is_migrated()).count();
    let failed = results.iter().filter(|r| r.outcome.is_failed()).count();
    let output = json!({
        "total": results.len(),
        "migrated": migrated,
        "skipped": results.len() - migrated - failed,
        "failed": failed,
        "records": results,
    });

    if args.compact {
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    Ok(())
}

async fn migrate_all(migrator: &Migrator, records: Vec<Record>, concurrency: usize) -> Vec<RecordResult> {
    // Nothing persists here; the updated value is reported in the output instead.
    let updater = |_: EntityId, _: String| async { Ok::<(), anyhow::Error>(()) };
    let updater = &updater;

    stream::iter(records)
        .map(|record| async move {
            let outcome = migrator
                .migrate(record.image_url.as_deref(), EntityId(record.id), updater)
                .await;
            RecordResult {
                id: record.id,
                image_url: outcome.clone().into_value(),
                outcome,
            }
        })
        .buffered(concurrency)
        .collect()
        .await
}

fn load_records(target: &str) -> Result<Vec<Record>> {
    let raw = if target == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        let path = PathBuf::from(target);
        if !path.exists() {
            return Err(anyhow!("file not found: {}", target));
        }
        fs::read_to_string(&path)?
    };
    serde_json::from_str(&raw).with_context(|| format!("invalid records in {}", target))
}
