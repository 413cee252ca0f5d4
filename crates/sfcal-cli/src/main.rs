use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sfcal_core::{cell_text, sha256_file, Table};
use sfcal_runner::{
    aggregate_survival_fractions, describe_partitions, load_settings, AggregateError,
    Aggregation, FileChannelMapProvider, PartitionSummary, Settings,
};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sfcal", version, about = "Survival-fraction aggregation across calibration runs")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate survival fractions for every configured partition
    Run {
        settings: PathBuf,
        /// Override the channel-map directory from the settings
        #[arg(long)]
        channel_maps: Option<PathBuf>,
        /// Write the result table as CSV
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Resolve records and channel maps without extracting
    Describe {
        settings: PathBuf,
        #[arg(long)]
        channel_maps: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Check a settings file against the schema
    Validate {
        settings: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            if let Some(AggregateError::PathNotFound { .. }) = err.downcast_ref::<AggregateError>() {
                println!("{}", err);
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .init();
    debug!("sfcal started with verbosity level: {}", verbose);
}

fn provider_for(settings: &Settings, channel_maps: Option<PathBuf>) -> FileChannelMapProvider {
    FileChannelMapProvider::new(channel_maps.unwrap_or_else(|| settings.channel_map_root()))
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            settings,
            channel_maps,
            out,
            json,
        } => {
            let loaded = load_settings(&settings)?;
            let provider = provider_for(&loaded, channel_maps);
            let aggregation = aggregate_survival_fractions(&loaded, &provider)?;
            if let Some(out) = &out {
                write_csv(&aggregation.table, out)?;
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "generated_at": Utc::now().to_rfc3339(),
                    "settings": settings.display().to_string(),
                    "out": out.as_ref().map(|p| p.display().to_string()),
                    "rows": aggregation.table.len(),
                    "columns": aggregation.table.columns(),
                    "records": aggregation.table.to_records(),
                    "sources": sources_to_json(&aggregation)?,
                })));
            }
            print!("{}", aggregation.table);
            println!("rows: {}", aggregation.table.len());
            if let Some(out) = &out {
                println!("wrote: {}", out.display());
            }
        }
        Commands::Describe {
            settings,
            channel_maps,
            json,
        } => {
            let loaded = load_settings(&settings)?;
            let provider = provider_for(&loaded, channel_maps);
            let summaries = describe_partitions(&loaded, &provider)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "channel_maps": provider.root().display().to_string(),
                    "partitions": summaries.iter().map(summary_to_json).collect::<Vec<_>>(),
                })));
            }
            println!("channel_maps: {}", provider.root().display());
            for summary in &summaries {
                print_summary(summary);
            }
        }
        Commands::Validate { settings, json } => {
            let loaded = load_settings(&settings)?;
            let runs: usize = loaded.partitions.iter().map(|(_, r)| r.len()).sum();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "valid": true,
                    "partitions": loaded.partitions.len(),
                    "runs": runs,
                    "survival_fractions": loaded.survival_fractions.len(),
                })));
            }
            println!("ok");
            println!("partitions: {}", loaded.partitions.len());
            println!("runs: {}", runs);
            println!("survival_fractions: {}", loaded.survival_fractions.len());
        }
    }
    Ok(None)
}

fn write_csv(table: &Table, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    let header: Vec<&str> = std::iter::once(table.index_name())
        .chain(table.columns().iter().map(String::as_str))
        .collect();
    writer.write_record(&header)?;
    for (label, values) in table.rows() {
        let record: Vec<String> = std::iter::once(label.to_string())
            .chain(values.iter().map(cell_text))
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn sources_to_json(aggregation: &Aggregation) -> Result<Vec<Value>> {
    aggregation
        .sources
        .iter()
        .map(|source| {
            Ok(json!({
                "partition": source.partition,
                "run": source.run.to_string(),
                "path": source.path.display().to_string(),
                "sha256": sha256_file(&source.path)?,
            }))
        })
        .collect()
}

fn summary_to_json(summary: &PartitionSummary) -> Value {
    json!({
        "name": summary.name,
        "runs": summary.runs.iter().map(|r| json!({
            "run": r.run.to_string(),
            "record": r.record.display().to_string(),
            "channels": r.channels,
        })).collect::<Vec<_>>(),
    })
}

fn print_summary(summary: &PartitionSummary) {
    println!("partition: {}", summary.name);
    for run in &summary.runs {
        println!("  run: {}", run.run);
        println!("    record: {}", run.record.display());
        println!("    channels: {}", run.channels);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<AggregateError>() {
        Some(AggregateError::PathNotFound { .. }) => "path_not_found",
        Some(AggregateError::NoRecordFile { .. }) => "no_record_file",
        Some(AggregateError::ListDir { .. }) => "list_failed",
        Some(AggregateError::ChannelMap { .. }) => "channel_map_failed",
        Some(AggregateError::Extract { .. }) => "extract_failed",
        Some(AggregateError::Join { .. }) => "join_failed",
        Some(AggregateError::MissingChannelMap { .. }) => "missing_channel_map",
        Some(AggregateError::ColumnCollision { .. }) => "column_collision",
        None => "command_failed",
    }
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<AggregateError>() {
        Some(AggregateError::PathNotFound { path }) => json!({ "path": path.display().to_string() }),
        Some(AggregateError::NoRecordFile { dir }) | Some(AggregateError::ListDir { dir, .. }) => {
            json!({ "dir": dir.display().to_string() })
        }
        Some(AggregateError::ChannelMap { run, .. })
        | Some(AggregateError::Extract { run, .. })
        | Some(AggregateError::Join { run, .. })
        | Some(AggregateError::MissingChannelMap { run }) => json!({ "run": run.to_string() }),
        Some(AggregateError::ColumnCollision { column }) => json!({ "column": column }),
        None => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Validate { json, .. } => *json,
    }
}
