//! Command-line entrypoints for operating a local experiment event log.
//!
//! The crate exposes [`run_cli`] for the `sps` binary plus smaller helpers
//! ([`run_command_with_db`], [`run_command`]) used by tests to execute
//! commands without spawning a process.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use splitserve_core::{
    analysis_summary_to_json, analyze_events, assign_variant, format_rfc3339, AnalysisPolicy,
    AnalysisSummary, ComparisonStatus, PredictionEvent, PredictionEventInput, VariantGroupSummary,
    VariantLabel,
};
use splitserve_store_sqlite::SqliteEventStore;
use ulid::Ulid;

const INIT_CONTRACT_VERSION: &str = "store_init.v1";
const EVENTS_LIST_CONTRACT_VERSION: &str = "events_list.v1";
const ASSIGNMENT_CONTRACT_VERSION: &str = "assignment.v1";

#[derive(Debug, Parser)]
#[command(name = "sps", about = "Operate a local A/B prediction experiment log")]
pub struct Cli {
    /// Path to the SQLite event log.
    #[arg(long, default_value = "./splitserve.sqlite3")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize the event log schema and print its state.
    Init,
    /// Append one prediction event to the log.
    Record(RecordArgs),
    /// List recorded events, newest last.
    Events(EventsArgs),
    /// Resolve the sticky variant for an identity without opening the log.
    Assign(AssignArgs),
    /// Compare variants and write the analysis artifact.
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Request ULID; minted when omitted.
    #[arg(long)]
    pub request_id: Option<String>,

    /// Variant that served the prediction.
    #[arg(long, value_enum)]
    pub variant: VariantArg,

    /// Comma-separated feature values, e.g. "1.0,2.5,-0.25".
    #[arg(long)]
    pub features: String,

    /// Model output for the request.
    #[arg(long)]
    pub prediction: f64,

    /// Observed serving latency in milliseconds.
    #[arg(long)]
    pub latency_ms: f64,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    /// Restrict the listing to a single variant.
    #[arg(long, value_enum)]
    pub variant: Option<VariantArg>,

    /// Start the listing at this event sequence number.
    #[arg(long)]
    pub from_seq: Option<i64>,

    /// Emit a versioned JSON payload instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct AssignArgs {
    /// Caller identity used for sticky assignment.
    #[arg(long)]
    pub identity: String,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Significance threshold for declaring a winner.
    #[arg(long, default_value_t = 0.05)]
    pub significance_level: f64,

    /// Confidence level for per-group interval half-widths.
    #[arg(long, default_value_t = 0.95)]
    pub confidence_level: f64,

    /// Destination for the JSON analysis artifact.
    #[arg(long, default_value = "./analysis_summary.json")]
    pub output: PathBuf,

    /// Print the artifact JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VariantArg {
    A,
    B,
}

impl From<VariantArg> for VariantLabel {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::A => VariantLabel::A,
            VariantArg::B => VariantLabel::B,
        }
    }
}

/// Top-level dispatch for the `sps` binary.
///
/// `assign` is pure and runs before any store is opened; everything else
/// opens (and if needed creates) the SQLite event log first.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Assign(args) => run_assign(&args),
        command => run_command_with_db(&cli.db, command),
    }
}

/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteEventStore::open(db_path)
        .with_context(|| format!("failed to open event store at {}", db_path.display()))?;
    run_command(command, &mut store)
}

/// # Errors
/// Returns an error when the command fails against the given store.
pub fn run_command(command: Command, store: &mut SqliteEventStore) -> Result<()> {
    match command {
        Command::Init => run_init(store),
        Command::Record(args) => run_record(&args, store),
        Command::Events(args) => run_events(&args, store),
        Command::Assign(_) => Err(anyhow!(
            "internal dispatch error: assign does not require store initialization"
        )),
        Command::Analyze(args) => run_analyze(&args, store),
    }
}

fn run_init(store: &mut SqliteEventStore) -> Result<()> {
    let payload = json!({
        "contract_version": INIT_CONTRACT_VERSION,
        "schema_version": store.schema_version()?,
        "event_count": store.count_events()?,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_record(args: &RecordArgs, store: &mut SqliteEventStore) -> Result<()> {
    let request_id = match &args.request_id {
        Some(raw) => {
            Ulid::from_string(raw).with_context(|| format!("invalid request id: {raw}"))?
        }
        None => Ulid::new(),
    };
    let input = PredictionEventInput {
        request_id,
        variant: args.variant.into(),
        input_features: parse_features(&args.features)?,
        prediction: args.prediction,
        latency_ms: args.latency_ms,
    };
    let event = store.append_event(&input)?;
    println!("{}", serde_json::to_string_pretty(&event_to_json(&event)?)?);
    Ok(())
}

fn run_events(args: &EventsArgs, store: &mut SqliteEventStore) -> Result<()> {
    if args.variant.is_some() && args.from_seq.is_some() {
        return Err(anyhow!("--variant and --from-seq cannot be combined"));
    }

    let events = if let Some(variant) = args.variant {
        store.list_events_by_variant(variant.into())?
    } else if let Some(from_seq) = args.from_seq {
        store.list_events_from_seq(from_seq)?
    } else {
        store.list_events()?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&events_json_payload(&events)?)?);
    } else {
        print_events_table(&events)?;
    }
    Ok(())
}

fn run_assign(args: &AssignArgs) -> Result<()> {
    let identity = args.identity.trim();
    let variant = assign_variant(identity)?;
    let payload = json!({
        "contract_version": ASSIGNMENT_CONTRACT_VERSION,
        "identity": identity,
        "variant": variant.as_str(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_analyze(args: &AnalyzeArgs, store: &mut SqliteEventStore) -> Result<()> {
    let policy = AnalysisPolicy {
        significance_level: args.significance_level,
        confidence_level: args.confidence_level,
    };
    let events = store.list_events()?;
    let summary = analyze_events(&events, &policy)?;
    let artifact = analysis_summary_to_json(&summary)?;
    let serialized = serde_json::to_string_pretty(&artifact)?;

    if let Some(parent) = args.output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    // Write-then-rename so readers never observe a half-written artifact.
    let staging = args.output.with_extension("json.tmp");
    fs::write(&staging, format!("{serialized}\n"))
        .with_context(|| format!("failed to write {}", staging.display()))?;
    fs::rename(&staging, &args.output)
        .with_context(|| format!("failed to replace {}", args.output.display()))?;

    if args.json {
        println!("{serialized}");
    } else {
        print_analysis_summary(&summary, &args.output);
    }
    Ok(())
}

fn parse_features(raw: &str) -> Result<Vec<f64>> {
    let mut features = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            return Err(anyhow!(
                "features must be a comma-separated list of numbers, got {raw:?}"
            ));
        }
        let value: f64 = trimmed
            .parse()
            .with_context(|| format!("invalid feature value: {trimmed}"))?;
        features.push(value);
    }
    Ok(features)
}

fn event_to_json(event: &PredictionEvent) -> Result<serde_json::Value> {
    Ok(json!({
        "event_seq": event.event_seq,
        "request_id": event.request_id.to_string(),
        "recorded_at": format_rfc3339(event.recorded_at)?,
        "variant": event.variant.as_str(),
        "input_features": event.input_features,
        "prediction": event.prediction,
        "latency_ms": event.latency_ms,
    }))
}

fn events_json_payload(events: &[PredictionEvent]) -> Result<serde_json::Value> {
    let mut rendered = Vec::with_capacity(events.len());
    for event in events {
        rendered.push(event_to_json(event)?);
    }
    Ok(json!({
        "contract_version": EVENTS_LIST_CONTRACT_VERSION,
        "event_count": events.len(),
        "events": rendered,
    }))
}

fn print_events_table(events: &[PredictionEvent]) -> Result<()> {
    if events.is_empty() {
        println!("no events recorded");
        return Ok(());
    }
    println!(
        "{:<6} {:<28} {:<8} {:<12} {:<12} {}",
        "seq", "request_id", "variant", "prediction", "latency_ms", "recorded_at"
    );
    println!("{}", "-".repeat(96));
    for event in events {
        println!(
            "{:<6} {:<28} {:<8} {:<12.4} {:<12.3} {}",
            event.event_seq,
            event.request_id.to_string(),
            event.variant.as_str(),
            event.prediction,
            event.latency_ms,
            format_rfc3339(event.recorded_at)?,
        );
    }
    Ok(())
}

fn print_analysis_summary(summary: &AnalysisSummary, output: &Path) {
    println!(
        "events={} significance_level={} confidence_level={}",
        summary.event_count, summary.significance_level, summary.confidence_level
    );
    println!(
        "{:<8} {:<10} {:<16} {:<14} {:<16} {}",
        "variant", "requests", "mean_prediction", "pred_ci_half", "mean_latency_ms", "latency_ci_half_ms"
    );
    println!("{}", "-".repeat(90));
    print_group_row(&summary.group_a);
    print_group_row(&summary.group_b);

    let comparison = &summary.latency_comparison;
    match comparison.status {
        ComparisonStatus::Compared => {
            let winner = match comparison.winner {
                Some(variant) => variant.as_str(),
                None => "none",
            };
            println!(
                "latency_test=welch_t status=compared t={} df={} p={} significant={} winner={}",
                format_optional(comparison.t_statistic),
                format_optional(comparison.degrees_of_freedom),
                format_optional(comparison.p_value),
                if comparison.significant { "yes" } else { "no" },
                winner,
            );
        }
        ComparisonStatus::InsufficientData => {
            println!("latency_test=welch_t status=insufficient_data");
        }
    }
    println!("artifact written to {}", output.display());
}

fn print_group_row(group: &VariantGroupSummary) {
    println!(
        "{:<8} {:<10} {:<16} {:<14} {:<16} {}",
        group.variant.as_str(),
        group.request_count,
        format_optional(group.mean_prediction),
        format!("{:.3}", group.prediction_ci_half_width),
        format_optional(group.mean_latency_ms),
        format!("{:.3}", group.latency_ci_half_width_ms),
    );
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |value| format!("{value:.3}"))
}
