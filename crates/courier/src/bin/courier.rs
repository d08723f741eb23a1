// ABOUTME: CLI binary for checking, probing, and migrating a single external image URL.
// ABOUTME: Prints JSON on stdout, logs to stderr, and exits 1 when the URL is rejected or migration fails.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pantry_courier::cli::{init_tracing, ConfigArgs};
use pantry_courier::{EntityId, MigratorBuilder};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Validate, probe, and migrate externally hosted images")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,

    /// Output compact JSON instead of pretty
    #[arg(long, default_value_t = false)]
    compact: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the URL policy (scheme, allowlist, DNS) without fetching anything
    Check { url: String },
    /// Check declared content type and length with a metadata-only request
    Probe { url: String },
    /// Download an external image into the local store
    Migrate {
        /// Entity the image belongs to; names the stored file
        #[arg(long)]
        entity: u64,
        /// Stored value: an external URL, or an already-local path
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let migrator = match MigratorBuilder::from_options(args.config.to_options()).build() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    let (output, ok) = match &args.command {
        Command::Check { url } => {
            let verdict = migrator.validate(url).await;
            let ok = verdict.allowed;
            (json!({ "url": url, "allowed": verdict.allowed, "reason": verdict.reason }), ok)
        }
        Command::Probe { url } => match migrator.probe(url).await {
            Ok(result) => (json!({ "url": url, "ok": true, "probe": result }), true),
            Err(e) => (
                json!({ "url": url, "ok": false, "code": e.code, "reason": e.reason() }),
                false,
            ),
        },
        Command::Migrate { entity, url } => {
            // No record store behind the CLI; the outcome on stdout is the record.
            let updater = |_: EntityId, _: String| async { Ok::<(), anyhow::Error>(()) };
            let outcome = migrator
                .migrate(Some(url.as_str()), EntityId(*entity), &updater)
                .await;
            let ok = !outcome.is_failed();
            (json!({ "entity": entity, "outcome": outcome }), ok)
        }
    };

    if let Err(e) = print_json(&output, args.compact) {
        eprintln!("error writing output: {}", e);
        return ExitCode::from(1);
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn print_json(value: &Value, compact: bool) -> serde_json::Result<()> {
    let rendered = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{}", rendered);
    Ok(())
}
