mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vlc_lab_abstract::{RunProfile, RunResult};
use vlc_lab_measure::{Endpoint, Measurement, RunCoordinator, RunReport, SimulatedTestbed, codec};

use crate::settings::{
    AnalysisFlags, LinkFlags, OutputFlags, OutputSettings, RunFlags, SerialFlags, SerialSettings,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Latency and reliability measurements on the VLC testbed")]
struct Args {
    /// TOML profile applied on top of the defaults, before any flag.
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure over the two serial-attached nodes.
    Run {
        #[command(flatten)]
        serial: SerialFlags,
        #[command(flatten)]
        run: RunFlags,
        #[command(flatten)]
        output: OutputFlags,
        #[command(flatten)]
        analysis: AnalysisFlags,
    },
    /// Measure against two emulated nodes and a simulated light link.
    Simulate {
        #[command(flatten)]
        run: RunFlags,
        #[command(flatten)]
        link: LinkFlags,
        #[command(flatten)]
        output: OutputFlags,
        #[command(flatten)]
        analysis: AnalysisFlags,
    },
    /// Compute the statistics of a stored run file.
    Analyze {
        file: PathBuf,
        /// Leave out records that break a timing constraint.
        #[arg(long, default_value_t = false)]
        valid_only: bool,
        /// Write a JSON report of the run.
        #[arg(long)]
        report_out: Option<PathBuf>,
        #[command(flatten)]
        analysis: AnalysisFlags,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!("vlc-lab starting...");

    let profile = settings::load_profile(args.profile.as_deref())?;
    match args.command {
        Command::Run {
            serial,
            run,
            output,
            analysis,
        } => run_testbed(&profile, &serial, &run, &output, &analysis).await,
        Command::Simulate {
            run,
            link,
            output,
            analysis,
        } => run_simulation(&profile, &run, &link, &output, &analysis).await,
        Command::Analyze {
            file,
            valid_only,
            report_out,
            analysis,
        } => analyze(&file, valid_only, report_out.as_deref(), &analysis),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_port(path: &str, baud_rate: u32) -> Result<SerialStream> {
    tokio_serial::new(path, baud_rate)
        .open_native_async()
        .with_context(|| format!("Failed to open serial port {path}"))
}

async fn run_testbed(
    profile: &RunProfile,
    serial: &SerialFlags,
    run: &RunFlags,
    output: &OutputFlags,
    analysis: &AnalysisFlags,
) -> Result<()> {
    let (config, timeouts) = settings::resolve_run(profile, run);
    let serial = SerialSettings::resolve(&profile.serial, serial);
    let output = OutputSettings::resolve(&profile.output, output);

    let sender = open_port(&serial.sender_port, serial.baud_rate)?;
    let receiver = open_port(&serial.receiver_port, serial.baud_rate)?;

    let measurement = RunCoordinator::new(config, timeouts)
        .run(
            Endpoint::new(serial.sender_port.clone(), sender),
            Endpoint::new(serial.receiver_port.clone(), receiver),
        )
        .await
        .context("Measurement failed")?;
    finish_measurement(&measurement, &output, analysis)
}

async fn run_simulation(
    profile: &RunProfile,
    run: &RunFlags,
    link: &LinkFlags,
    output: &OutputFlags,
    analysis: &AnalysisFlags,
) -> Result<()> {
    let (config, timeouts) = settings::resolve_run(profile, run);
    let (link, drops) = settings::resolve_link(profile, link);
    let output = OutputSettings::resolve(&profile.output, output);

    info!(
        "Simulated link: loss {} / udp loss {} / corrupt {}, latency {}..={} us, seed {}",
        link.link_loss_rate,
        link.udp_loss_rate,
        link.corrupt_rate,
        link.min_latency_us,
        link.max_latency_us,
        link.seed
    );
    let mut testbed = SimulatedTestbed::new(link);
    for seq in drops {
        testbed.add_forced_drop(seq);
    }
    let (sender, receiver) = testbed.spawn();

    let measurement = RunCoordinator::new(config, timeouts)
        .run(
            Endpoint::new("sim-sender", sender),
            Endpoint::new("sim-receiver", receiver),
        )
        .await
        .context("Measurement failed")?;
    finish_measurement(&measurement, &output, analysis)
}

fn finish_measurement(
    measurement: &Measurement,
    output: &OutputSettings,
    analysis: &AnalysisFlags,
) -> Result<()> {
    if let Some(directory) = &output.directory {
        codec::save(
            &measurement.result,
            directory,
            &output.subfolder,
            output.note.as_deref(),
        )
        .context("Failed to save measurement")?;
    }

    let report = RunReport::from_measurement(measurement, &analysis.report_options())
        .context("Failed to compute statistics")?;
    log_summary(&report);
    if let Some(path) = &output.report_out {
        write_report(path, &report)?;
    }
    Ok(())
}

fn analyze(
    file: &Path,
    valid_only: bool,
    report_out: Option<&Path>,
    analysis: &AnalysisFlags,
) -> Result<()> {
    let mut result = codec::load(file)
        .with_context(|| format!("Failed to load measurement {}", file.display()))?;
    if valid_only {
        let records = result.valid_records().cloned().collect();
        result = RunResult::new(result.config().clone(), records);
    }

    let report = RunReport::build(&result, &analysis.report_options())
        .context("Failed to compute statistics")?;
    log_summary(&report);
    if let Some(path) = report_out {
        write_report(path, &report)?;
    }
    Ok(())
}

fn log_summary(report: &RunReport) {
    info!(
        "Packets: {} | invalid records: {}",
        report.packets,
        report.validity.invalid_count()
    );
    for listener in report.sender.iter().chain(report.receiver.iter()) {
        info!(
            "[{}] {:?} | lines: {} | events: {} | anomalies: {} | duplicates: {} | drops: {}",
            listener.role,
            listener.status,
            listener.lines_read,
            listener.events_stored,
            listener.anomalies,
            listener.duplicates,
            listener.drop_count
        );
    }
    for layer in &report.layers {
        match layer.reliability {
            Some(reliability) => info!(
                "[{}] reliability {:.3} ({} of {})",
                layer.layer, reliability, layer.received, layer.sent
            ),
            None => warn!("[{}] no packets sent", layer.layer),
        }
        if let Some(latency) = &layer.latency {
            info!(
                "[{}] latency mean {:.3} ms | p50 {:.3} ms | p99 {:.3} ms | max {:.3} ms",
                layer.layer, latency.mean_ms, latency.p50_ms, latency.p99_ms, latency.max_ms
            );
        }
        if let Some(throughput) = layer.throughput_bps {
            info!("[{}] throughput {:.1} bit/s", layer.layer, throughput);
        }
    }
    for (violation, count) in report.validity.by_violation() {
        warn!("{} records: {}", count, violation);
    }
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize run report")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write report file {}", path.display()))?;
    info!("Report written to {}", path.display());
    Ok(())
}
