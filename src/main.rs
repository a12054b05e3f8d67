use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tvdb::ingestion::validation::ValidationConfig;
use tvdb::ingestion::Ingestor;
use tvdb::storage::{Record, Scan};
use tvdb::{metrics, Config, Database};

#[derive(Parser, Debug)]
#[command(name = "tvdb", about = "Store and query surveillance target values")]
struct Args {
    /// Path to a JSON config file
    #[arg(short, long, value_name = "FILE", env = "TVDB_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the write-ahead log (overrides the config file)
    #[arg(long, env = "TVDB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Address for the Prometheus endpoint (overrides the config file)
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upsert target values from a JSON or CSV file
    Import {
        file: PathBuf,
        /// Input format; defaults to the file extension
        #[arg(long)]
        format: Option<String>,
    },
    /// Print one record
    Get {
        target: String,
        epiweek: i32,
        location: Option<String>,
    },
    /// Print every record matching one indexed column
    #[command(group(ArgGroup::new("column").required(true)))]
    Scan {
        #[arg(long, group = "column")]
        target: Option<String>,
        #[arg(long, group = "column")]
        epiweek: Option<i32>,
        #[arg(long, group = "column")]
        location: Option<String>,
        /// Records stored without a location
        #[arg(long, group = "column")]
        no_location: bool,
    },
    /// Print one series between two epiweeks, inclusive
    Range {
        target: String,
        first: i32,
        last: i32,
        #[arg(long)]
        location: Option<String>,
    },
    /// List epiweeks with no value for a series
    Missing {
        target: String,
        first: i32,
        last: i32,
        #[arg(long)]
        location: Option<String>,
    },
    /// Remove one record
    Delete {
        target: String,
        epiweek: i32,
        location: Option<String>,
    },
    /// Rewrite the write-ahead log as a snapshot
    Compact,
    /// Check write-ahead log checksums
    Verify,
    /// Keep the store open and the metrics endpoint up until Ctrl-C
    Serve,
}

/// Normalizes a location argument the way import stores locations
fn lookup_location(validation: &ValidationConfig, location: Option<String>) -> Option<String> {
    location.map(|location| validation.normalize_location(&location))
}

fn print_record(record: &Record) {
    println!(
        "{}",
        json!({
            "id": record.id(),
            "target": record.target(),
            "epiweek": record.epiweek(),
            "location": record.location(),
            "value": record.value(),
        })
    );
}

fn print_scan(scan: Scan) {
    for record in scan {
        print_record(&record);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // CLI flags override the config file, which overrides defaults.
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(addr) = args.metrics_addr {
        config.metrics_addr = Some(addr);
    }

    if let Some(addr) = config.metrics_addr {
        metrics::init_metrics(addr).context("starting metrics exporter")?;
        info!("Metrics server listening on {}", addr);
    }

    let db = Database::open(&config.data_dir, &config.wal)
        .with_context(|| format!("opening database in {}", config.data_dir.display()))?;
    let store = db.store();
    let location_of = |location| lookup_location(&config.validation, location);

    match args.command {
        Command::Import { file, format } => {
            let ingestor = Ingestor::with_config(config.validation.clone());
            let report = ingestor
                .ingest_file(&db, &file, format.as_deref())
                .await
                .with_context(|| format!("importing {}", file.display()))?;
            for (row, err) in &report.rejected {
                eprintln!("row {}: {}", row, err);
            }
            println!(
                "{}",
                json!({
                    "parsed": report.parsed,
                    "inserted": report.inserted,
                    "replaced": report.replaced,
                    "rejected": report.rejected.len(),
                })
            );
        }
        Command::Get {
            target,
            epiweek,
            location,
        } => {
            let location = location_of(location);
            let record = store.get(&target, epiweek, location.as_deref())?;
            print_record(&record);
        }
        Command::Scan {
            target,
            epiweek,
            location,
            no_location,
        } => {
            // clap guarantees exactly one column was given
            let scan = if let Some(target) = target {
                store.scan_by_target(&target)
            } else if let Some(epiweek) = epiweek {
                store.scan_by_epiweek(epiweek)
            } else if let Some(location) = location_of(location) {
                store.scan_by_location(&location)
            } else {
                debug_assert!(no_location);
                store.scan_without_location()
            };
            print_scan(scan);
        }
        Command::Range {
            target,
            first,
            last,
            location,
        } => {
            let location = location_of(location);
            print_scan(store.scan_range(&target, location.as_deref(), first, last))
        }
        Command::Missing {
            target,
            first,
            last,
            location,
        } => {
            let location = location_of(location);
            for epiweek in store.missing_epiweeks(&target, location.as_deref(), first, last)? {
                println!("{}", epiweek);
            }
        }
        Command::Delete {
            target,
            epiweek,
            location,
        } => {
            let location = location_of(location);
            let removed = db.delete(&target, epiweek, location.as_deref()).await?;
            println!("{}", json!({ "deleted": removed }));
        }
        Command::Compact => {
            let removed = db.compact().await?;
            println!("{}", json!({ "segments_removed": removed }));
        }
        Command::Verify => {
            let ok = db.verify()?;
            println!("{}", json!({ "ok": ok }));
            if !ok {
                anyhow::bail!("write-ahead log failed verification");
            }
        }
        Command::Serve => {
            let stats = store.stats();
            metrics::update_record_count(stats.records);
            info!(
                "Serving: records={}, targets={}, epiweeks={}, locations={}",
                stats.records, stats.targets, stats.epiweeks, stats.locations
            );
            tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
            info!("Shutting down...");
        }
    }

    Ok(())
}
