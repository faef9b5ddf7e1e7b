use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tool_telemetry::{
    ConnectionState, ConnectionStatus, FailureRateDataPoint, IngestOutcome, LatencyDataPoint,
    MetricsOverview, TelemetryConfig, TelemetryService, TokenUsageDataPoint, ToolCallDataPoint,
    ToolCallEvent, ToolCallStatus, MAX_WINDOW_HOURS,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tool-telemetry")]
#[command(about = "Live tool call telemetry: ingest, aggregate and inspect")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "TOOL_TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a live feed and print calls as they arrive
    Watch {
        /// WebSocket endpoint, overrides the configured transport_url
        #[arg(long, env = "TOOL_TELEMETRY_URL")]
        url: Option<String>,

        /// Print the overview and latency table every N seconds
        #[arg(long, default_value = "30")]
        summary_every: u64,

        /// Query window in hours, defaults to the configured bucket_window_hours
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=MAX_WINDOW_HOURS as i64))]
        hours: Option<u32>,
    },
    /// Feed a file of newline-delimited wire frames through the pipeline and print every metric
    Replay {
        /// NDJSON file, one frame per line
        file: PathBuf,

        /// Query window in hours, ending at the newest replayed event
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=MAX_WINDOW_HOURS as i64))]
        hours: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch {
            url,
            summary_every,
            hours,
        } => {
            let mut config = config;
            if let Some(url) = url {
                config.transport_url = url;
            }
            let hours = hours.unwrap_or(config.bucket_window_hours);
            watch(config, hours, Duration::from_secs(summary_every.max(1))).await
        }
        Commands::Replay { file, hours } => {
            let hours = hours.unwrap_or(config.bucket_window_hours);
            replay(config, &file, hours).await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TelemetryConfig> {
    match path {
        Some(path) => TelemetryConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(TelemetryConfig::default()),
    }
}

async fn watch(config: TelemetryConfig, hours: u32, summary_every: Duration) -> anyhow::Result<()> {
    let service = TelemetryService::new(config).context("invalid configuration")?;
    let window = i64::from(hours);
    let mut status = service.watch_status();
    let mut generations = service.watch_invalidations();
    // replacements keep their slot, so only fresh inserts are printed
    let mut cursor = service.store().snapshot().next_slot();
    let mut summary = tokio::time::interval(summary_every);
    summary.tick().await;

    println!(
        "{}",
        format!("📡 Watching {} (Ctrl-C to stop)", service.config().transport_url).cyan()
    );
    service.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                service.stop().await;
                print_summary(&service, window)?;
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                print_status(&current);
                if current.state == ConnectionState::Failed {
                    println!("{}", "Live feed lost; data shown may be stale.".yellow());
                }
            }
            changed = generations.changed() => {
                if changed.is_err() {
                    break;
                }
                generations.borrow_and_update();
                let snapshot = service.store().snapshot();
                for call in &snapshot.inserted_since(cursor) {
                    print_call(call);
                }
                cursor = snapshot.next_slot();
            }
            _ = summary.tick() => print_summary(&service, window)?,
        }
    }

    Ok(())
}

async fn replay(config: TelemetryConfig, file: &Path, hours: u32) -> anyhow::Result<()> {
    let service = TelemetryService::new(config).context("invalid configuration")?;
    tracing::info!("Replaying frames from {}", file.display());
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let IngestOutcome::Rejected(e) = service.ingest_frame(line) {
            eprintln!("{}", format!("line {}: {}", index + 1, e).red());
        }
    }

    let stats = service.ingest_stats();
    println!(
        "{}",
        format!(
            "Replayed {} frames: {} stored, {} replaced, {} ignored, {} rejected",
            stats.frames(),
            stats.accepted,
            stats.replaced,
            stats.ignored,
            stats.rejected
        )
        .bold()
    );

    let snapshot = service.store().snapshot();
    let Some(anchor) = snapshot.iter().map(|e| e.started_at).max() else {
        println!("{}", "No tool calls to report.".yellow());
        return Ok(());
    };

    print_report(&service, hours, anchor);
    Ok(())
}

fn print_summary(service: &TelemetryService, hours: i64) -> anyhow::Result<()> {
    println!();
    print_overview(&service.get_overview(hours)?, hours);
    print_latency(&service.get_latency_by_tool(hours)?);
    println!();
    Ok(())
}

fn print_report(service: &TelemetryService, hours: u32, now: DateTime<Utc>) {
    let aggregator = service.aggregator();
    println!();
    print_overview(&aggregator.overview_at(hours, now), i64::from(hours));
    print_hourly(
        &aggregator.tool_call_series_at(hours, now),
        &aggregator.token_usage_series_at(hours, now),
        &aggregator.failure_rate_series_at(hours, now),
    );
    print_latency(&aggregator.latency_by_tool_at(hours, now));
}

fn print_status(status: &ConnectionStatus) {
    let state = match status.state {
        ConnectionState::Open => status.state.to_string().green(),
        ConnectionState::Connecting => status.state.to_string().cyan(),
        ConnectionState::Closed => status.state.to_string().yellow(),
        ConnectionState::Failed => status.state.to_string().red(),
    };
    let mut line = format!("[connection] {}", state);
    if status.attempt > 0 {
        line.push_str(&format!(" attempt {}", status.attempt));
    }
    if let Some(retry) = status.retry_in_ms {
        line.push_str(&format!(", retrying in {}ms", retry));
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!(" ({})", error.dimmed()));
    }
    println!("{}", line);
}

fn print_call(call: &ToolCallEvent) {
    let status = match call.status {
        ToolCallStatus::Success => "✓".green(),
        ToolCallStatus::Failed => "✗".red(),
    };
    let mut line = format!(
        "{} {} {:<12} {:>6}ms  {}",
        status,
        call.started_at.format("%H:%M:%S%.3f"),
        call.tool.bold(),
        call.duration_ms,
        call.request_id.dimmed()
    );
    if let Some(sequence) = call.sequence {
        line.push_str(&format!(" #{}", sequence));
    }
    if let Some(error) = &call.error {
        line.push_str(&format!("  {}", error.red()));
    }
    println!("{}", line);
}

fn print_overview(overview: &MetricsOverview, hours: i64) {
    println!("{}", format!("Last {}h", hours).bold().underline());
    println!(
        "  calls {}  avg latency {:.1}ms  tokens {}  failure rate {:.2}%  change {:+.1}%",
        overview.total_calls.to_string().bold(),
        overview.avg_latency_ms,
        overview.total_tokens,
        overview.failure_rate,
        overview.change_percent
    );
}

fn print_latency(latency: &[LatencyDataPoint]) {
    if latency.is_empty() {
        println!("  {}", "no latency samples".dimmed());
        return;
    }
    println!(
        "  {:<12} {:>7} {:>8} {:>8} {:>8}",
        "tool".bold(),
        "samples",
        "p50",
        "p95",
        "p99"
    );
    for point in latency {
        println!(
            "  {:<12} {:>7} {:>6}ms {:>6}ms {:>6}ms",
            point.tool, point.samples, point.p50, point.p95, point.p99
        );
    }
}

fn print_hourly(
    calls: &[ToolCallDataPoint],
    tokens: &[TokenUsageDataPoint],
    failures: &[FailureRateDataPoint],
) {
    println!(
        "  {:<17} {:>8} {:>8} {:>7} {:>9} {:>9}",
        "hour".bold(),
        "success",
        "failures",
        "fail%",
        "input",
        "output"
    );
    for ((call, token), failure) in calls.iter().zip(tokens).zip(failures) {
        if call.success + call.failures == 0 {
            continue;
        }
        let rate = format!("{:>6.2}%", failure.failure_percent);
        let rate = if failure.failure_percent > 0.0 {
            rate.red()
        } else {
            rate.normal()
        };
        println!(
            "  {:<17} {:>8} {:>8} {} {:>9} {:>9}",
            call.start.format("%Y-%m-%d %H:00"),
            call.success,
            call.failures,
            rate,
            token.input,
            token.output
        );
    }
}
