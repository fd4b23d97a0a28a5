mod api;
mod config;
mod slots;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use log::{LevelFilter, debug, info};

use crate::api::{ApiServer, ApiServerConfig};
use crate::config::{Settings, load_settings};
use crate::slots::codec::{decode_query, encode_query, format_timestamp, parse_timestamp};
use crate::slots::model::{EditPolicy, Interval, IntervalId, Segment};
use crate::slots::mutation::Command;
use crate::slots::storage::FileStorage;
use crate::slots::store::{EditOutcome, IntervalStore};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliPolicy {
    Legacy,
    Strict,
}

impl From<CliPolicy> for EditPolicy {
    fn from(value: CliPolicy) -> Self {
        match value {
            CliPolicy::Legacy => EditPolicy::Legacy,
            CliPolicy::Strict => EditPolicy::Strict,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "hourslots",
    version,
    about = "Hour-granularity availability editing over a local interval store"
)]
struct Cli {
    #[arg(long, global = true, default_value = "events.json")]
    store: PathBuf,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    policy: Option<CliPolicy>,

    #[arg(long, global = true)]
    granularity_minutes: Option<i64>,

    #[arg(long, global = true)]
    key: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Print every interval with its id.
    List,
    Add {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "")]
        title: String,
    },
    /// Print hour segments, for one interval or all of them.
    Segments {
        #[arg(long)]
        id: Option<u64>,
    },
    MoveDate {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        date: NaiveDate,
    },
    MoveHour {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        hour: u32,
    },
    DeleteSegment {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
    Delete {
        #[arg(long)]
        id: u64,
    },
    Clear,
    /// Print the collection as an `events=` query string.
    ExportQuery,
    /// Replace the collection with the events carried by a query string.
    ImportQuery { query: String },
    /// Serve the local HTTP API until interrupted.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8099)]
        port: u16,
    },
}

fn main() {
    // RUST_LOG still overrides the default level.
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    let storage = FileStorage::new(&cli.store);
    debug!("opening store {}", storage.path().display());
    let (mut store, report) =
        IntervalStore::open(storage, settings.storage_key.clone(), settings.segmenter())
            .with_context(|| format!("failed to load {}", cli.store.display()))?;
    debug!("loaded {} interval(s)", report.loaded);
    if report.reset {
        println!("store was unreadable and has been reset");
    } else if report.dropped > 0 {
        println!("dropped {} unreadable event(s)", report.dropped);
    }

    match cli.command {
        CliCommand::List => {
            if store.intervals().is_empty() {
                println!("no intervals");
            }
            for interval in store.intervals() {
                print_interval(interval);
            }
        }
        CliCommand::Add { start, end, title } => {
            let id = store.add(parse_timestamp(&start)?, parse_timestamp(&end)?, title)?;
            println!("added interval {id}");
        }
        CliCommand::Segments { id: Some(id) } => {
            let id = IntervalId(id);
            let Some(interval) = store.get(id) else {
                bail!("unknown interval {id}");
            };
            print_interval(interval);
            for segment in store.segmenter().segment(interval) {
                print_segment(&segment);
            }
        }
        CliCommand::Segments { id: None } => {
            for (owner, segments) in store.segmenter().segment_all(store.intervals()) {
                println!("interval {owner}");
                for segment in &segments {
                    print_segment(segment);
                }
            }
        }
        CliCommand::MoveDate {
            id,
            start,
            end,
            date,
        } => apply_edit(
            &mut store,
            Command::MoveDate {
                owner: IntervalId(id),
                start: parse_timestamp(&start)?,
                end: parse_timestamp(&end)?,
                date,
            },
        )?,
        CliCommand::MoveHour {
            id,
            start,
            end,
            hour,
        } => apply_edit(
            &mut store,
            Command::MoveHour {
                owner: IntervalId(id),
                start: parse_timestamp(&start)?,
                end: parse_timestamp(&end)?,
                hour,
            },
        )?,
        CliCommand::DeleteSegment { id, start, end } => apply_edit(
            &mut store,
            Command::DeleteSegment {
                owner: IntervalId(id),
                start: parse_timestamp(&start)?,
                end: parse_timestamp(&end)?,
            },
        )?,
        CliCommand::Delete { id } => {
            let id = IntervalId(id);
            if store.remove(id)? {
                println!("deleted interval {id}");
            } else {
                println!("interval {id} not found");
            }
        }
        CliCommand::Clear => {
            store.clear()?;
            println!("cleared");
        }
        CliCommand::ExportQuery => println!("{}", encode_query(store.intervals())?),
        CliCommand::ImportQuery { query } => {
            let decoded = decode_query(&query)?;
            if decoded.corrupt {
                bail!("query 'events' parameter is not an event array");
            }
            let imported = store.import(decoded.events)?;
            println!("imported {imported} interval(s), dropped {}", decoded.dropped);
        }
        CliCommand::Serve { bind, port } => {
            let store = Arc::new(Mutex::new(store));
            let server = ApiServer::start(
                ApiServerConfig {
                    bind_addr: bind.clone(),
                    port,
                },
                store,
            )
            .with_context(|| format!("failed to start local API at {bind}:{port}"))?;
            info!("policy {}", settings.policy.as_str());
            server.join();
        }
    }

    Ok(())
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => load_settings(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Settings::default(),
    };

    if let Some(policy) = cli.policy {
        settings.policy = policy.into();
    }
    if let Some(minutes) = cli.granularity_minutes {
        settings.granularity_minutes = minutes;
    }
    if let Some(key) = &cli.key {
        settings.storage_key = key.clone();
    }
    settings.validate()?;
    Ok(settings)
}

fn apply_edit(store: &mut IntervalStore<FileStorage>, command: Command) -> Result<()> {
    match store.apply(&command)? {
        EditOutcome::Changed { intervals } => println!("applied; {intervals} interval(s)"),
        EditOutcome::Ignored(reason) => println!("ignored: {reason}"),
    }
    Ok(())
}

fn print_interval(interval: &Interval) {
    println!(
        "{:>4}  {} -> {}  {}",
        interval.id.0,
        format_timestamp(&interval.start),
        format_timestamp(&interval.end),
        interval.label
    );
}

fn print_segment(segment: &Segment) {
    println!(
        "      {} -> {}",
        format_timestamp(&segment.start),
        format_timestamp(&segment.end)
    );
}
