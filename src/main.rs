use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use larva_vr::config::{LoggingConfig, RunConfig};
use larva_vr::ipc::control::StopEvent;
use larva_vr::logging::init_logging;
use larva_vr::protocol::sequencer::build_protocol;
use larva_vr::{Session, VrError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Closed-loop virtual reality for larval fish: tracks animals on camera and
/// drives projected stimuli from their pose.
#[derive(Parser, Debug)]
#[command(name = "larva_vr", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an experiment.
    Run(RunArgs),
    /// Validate the configuration and calibration without starting workers.
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML run file; falls back to $LARVA_VR_CONFIG, then defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds; runs until Ctrl-C otherwise
    #[arg(short, long)]
    duration: Option<f64>,

    /// Run directory (default: runs/<UTC timestamp>)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of animals rendered by the synthetic camera
    #[arg(long)]
    synthetic_animals: Option<usize>,

    /// Log filter, e.g. "debug" or "info,larva_vr::timing=trace"
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<VrError>().map_or(3, |e| e.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check(args) => check(args),
    };
    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("run failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_of(&err))
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<u8> {
    let mut config = match RunConfig::resolve(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            // Logging is configured from the file; fall back so the error is recorded.
            let _guard = init_logging(&LoggingConfig::default(), args.log_level.as_deref())?;
            return Err(err).context("loading configuration");
        }
    };
    if let Some(n) = args.synthetic_animals {
        config.camera.synthetic.n_animals = n;
        config.tracker.n_animals = n.max(1);
        config.validate().context("applying --synthetic-animals")?;
    }
    let duration = match args.duration {
        Some(sec) if !(sec > 0.0 && sec.is_finite()) => bail!(VrError::config("--duration must be positive")),
        Some(sec) => Some(Duration::from_secs_f64(sec)),
        None => None,
    };
    let guard = init_logging(&config.logging, args.log_level.as_deref())?;
    if let Some(file) = guard.log_file() {
        tracing::info!(path = %file.display(), "logging to file");
    }

    let output = args.output.unwrap_or_else(|| {
        PathBuf::from("runs").join(chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string())
    });

    let interrupt = StopEvent::new();
    let on_signal = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received");
            on_signal.set();
        }
    });

    let summary = tokio::task::spawn_blocking(move || Session::new(config, output).run(duration, &interrupt))
        .await
        .context("run thread panicked")??;

    for edge in &summary.report.edges {
        println!("{edge}");
    }
    println!(
        "run {} ({:?}); {} dropped, {} tracking failures; metadata in {}",
        summary.output_dir.display(),
        summary.reason,
        summary.total_dropped(),
        summary.tracking_failures(),
        summary.metadata_path.display()
    );
    Ok(summary.exit_code() as u8)
}

fn check(args: CheckArgs) -> anyhow::Result<u8> {
    let config = RunConfig::resolve(args.config.as_deref()).context("loading configuration")?;
    let _guard = init_logging(&config.logging, None)?;
    let calibration = config.calibration().context("loading calibration")?;
    let protocol = build_protocol(
        &config.protocol.items,
        config.protocol.short_trial_policy,
        config.protocol.min_trial_sec,
        config.frame_size(),
    )
    .context("building protocol")?;
    println!(
        "configuration OK: {}x{} @ {} fps, {} background / {} tracker workers, {} protocol items, {:.2} px/mm",
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        config.workers.background,
        config.workers.trackers,
        protocol.remaining(),
        calibration.pix_per_mm()
    );
    Ok(0)
}
