use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use image::{DynamicImage, RgbImage, RgbaImage};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use framebridge_core::capability::{self, SysfsProbe};
use framebridge_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use framebridge_core::controller::{FramePath, FrameStats, PipelineController, SetupOutcome};
use framebridge_core::device_catalog::list_devices;
use framebridge_core::logging::{open_file_sink, FileSink, LogFilters, LogSettings, DEFAULT_LOG_FILTER};
use framebridge_core::model_catalog::ModelCatalog;
use framebridge_core::ort_backend::OrtBackend;
use framebridge_core::runtime::{self, RuntimeLibrary};
use framebridge_core::types::{Frame, PixelFormat};

#[derive(Parser)]
#[command(
    name = "framebridge",
    about = "Real-time frame inference bridge with fail-static passthrough"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the compute devices of the inference backend
    Devices,
    /// List models found in the models directory
    Models(ModelsArgs),
    /// Show detected display adapters and the capability flag
    Probe,
    /// Drive the frame pipeline over a still image
    Run(RunArgs),
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, help = "Directory to scan instead of the configured models_dir")]
    dir: Option<PathBuf>,
    #[arg(long, help = "Print the catalog as JSON")]
    json: bool,
}

#[derive(Args)]
struct RunArgs {
    #[arg(short = 'i', long, help = "Source image; its size is used as the screen size")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Where to write the last destination frame")]
    output: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Number of frames to push through the pipeline"
    )]
    frames: u64,
    #[arg(
        long,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Inference height (overrides config)"
    )]
    target_height: Option<u32>,
    #[arg(long, help = "Start with the inference toggle off")]
    no_inference: bool,
    #[arg(long, help = "Skip the hardware probe and treat the host as capable")]
    assume_capable: bool,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let library = runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime::log_runtime_lib_status(&library);
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Devices => list_backend_devices(library, &config, &resolved_data_dir),
        Commands::Models(args) => list_models(args, &config, &resolved_data_dir),
        Commands::Probe => print_probe(&config),
        Commands::Run(args) => run_frames(args, library, &config, &resolved_data_dir),
    }
}

#[cfg(test)]
fn select_log_filter(rust_log_env: Option<&str>, verbose: u8, cli_log_filter: Option<&str>) -> String {
    let settings = LogSettings {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        ..Default::default()
    };

    LogFilters::compose(&settings).console
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let settings = LogSettings {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = LogFilters::compose(&settings);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    match open_file_sink(&settings) {
        FileSink::Rolling { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format_args!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn list_backend_devices(library: RuntimeLibrary, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let backend = OrtBackend::new(library, config.backend_options(data_dir));
    let devices = list_devices(&backend).context("failed to enumerate devices")?;
    for device in devices {
        println!("{}\t{}", device.index, device.name);
    }
    Ok(())
}

fn list_models(args: ModelsArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let models_dir = args
        .dir
        .unwrap_or_else(|| config.controller_options(data_dir).models_dir);
    let catalog = ModelCatalog::discover(models_dir, &config.inference.extension)
        .context("failed to scan models directory")?;

    if args.json {
        println!("{}", catalog.to_json()?);
        return Ok(());
    }

    if catalog.is_empty() {
        println!("No models in {}", catalog.models_dir().display());
    }
    for model in catalog.list() {
        let weights = model
            .weights_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}",
            model.display_name,
            model.description_path.display(),
            weights
        );
    }
    Ok(())
}

fn print_probe(config: &AppConfig) -> Result<()> {
    let report = capability::probe(&SysfsProbe::default(), &config.capability);
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to serialize probe report")?
    );
    Ok(())
}

fn run_frames(
    args: RunArgs,
    library: RuntimeLibrary,
    config: &AppConfig,
    data_dir: &Path,
) -> Result<()> {
    let source = load_frame(&args.input)?;

    let has_compatible_hardware = if args.assume_capable {
        info!("Hardware probe skipped; host assumed capable");
        true
    } else {
        capability::probe(&SysfsProbe::default(), &config.capability).compatible
    };

    let mut options = config.controller_options(data_dir);
    if args.no_inference {
        options.enabled = false;
    }
    let target_height = args
        .target_height
        .unwrap_or(config.inference.target_height);

    let backend = OrtBackend::new(library, config.backend_options(data_dir));
    let mut controller = PipelineController::new(Box::new(backend), options);

    match controller.setup(source.resolution(), target_height, has_compatible_hardware) {
        SetupOutcome::Inference {
            model,
            device,
            resolution,
        } => println!(
            "Inference: {} on {} at {resolution}",
            model.display_name, device.name
        ),
        SetupOutcome::Passthrough { reason } => println!("Passthrough: {reason}"),
    }

    let started = Instant::now();
    let mut destination = Frame::empty();
    for index in 0..args.frames {
        let was_active = controller.is_active();
        let path = controller.per_frame(&source, &mut destination);
        if was_active && path == FramePath::Passthrough {
            warn!(frame = index, "Inference disabled mid-run");
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    controller.shutdown();

    println!("{}", summarize_run(controller.stats(), elapsed));
    for diagnostic in controller.diagnostics() {
        println!(
            "[{}] {:?}: {}",
            diagnostic.at.to_rfc3339(),
            diagnostic.stage,
            diagnostic.message
        );
    }

    if let Some(output) = args.output {
        save_frame(&destination, &output)?;
        info!(path = %output.display(), "Wrote destination frame");
    }
    Ok(())
}

fn summarize_run(stats: FrameStats, elapsed_secs: f64) -> String {
    let total = stats.inferred + stats.passthrough;
    let fps = if elapsed_secs > 0.0 {
        total as f64 / elapsed_secs
    } else {
        0.0
    };
    format!(
        "Frames: {total} ({} inferred, {} passthrough) in {elapsed_secs:.2}s, {fps:.1} fps",
        stats.inferred, stats.passthrough
    )
}

fn load_frame(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    Ok(frame_from_image(image.to_rgba8()))
}

fn frame_from_image(image: RgbaImage) -> Frame {
    let (width, height) = image.dimensions();
    Frame {
        width,
        height,
        format: PixelFormat::Rgba8,
        data: image.into_raw(),
    }
}

fn frame_to_image(frame: &Frame) -> Result<DynamicImage> {
    let size_error = || {
        anyhow::anyhow!(
            "frame data does not match {}x{} {:?}",
            frame.width,
            frame.height,
            frame.format
        )
    };
    let image = match frame.format {
        PixelFormat::Rgba8 => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(size_error)?,
        ),
        PixelFormat::Bgra8 => {
            let mut data = frame.data.clone();
            for pixel in data.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
            DynamicImage::ImageRgba8(
                RgbaImage::from_raw(frame.width, frame.height, data).ok_or_else(size_error)?,
            )
        }
        PixelFormat::Rgb8 => DynamicImage::ImageRgb8(
            RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
                .ok_or_else(size_error)?,
        ),
    };
    Ok(image)
}

fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    if frame.resolution().is_empty() {
        bail!("no frame was produced");
    }
    frame_to_image(frame)?
        .save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn run_parses_all_flags() {
        let cli = Cli::try_parse_from([
            "framebridge",
            "-vv",
            "--data-dir",
            "/tmp/fb",
            "run",
            "--input",
            "in.png",
            "--output",
            "out.png",
            "--frames",
            "100",
            "--target-height",
            "720",
            "--no-inference",
            "--assume-capable",
        ])
        .expect("parse run");

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/fb")));
        let Commands::Run(run) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.input, PathBuf::from("in.png"));
        assert_eq!(run.output, Some(PathBuf::from("out.png")));
        assert_eq!(run.frames, 100);
        assert_eq!(run.target_height, Some(720));
        assert!(run.no_inference);
        assert!(run.assume_capable);
    }

    #[test]
    fn run_defaults_to_one_frame_and_rejects_zero() {
        let cli = Cli::try_parse_from(["framebridge", "run", "-i", "in.png"]).expect("parse");
        let Commands::Run(run) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.frames, 1);
        assert!(!run.assume_capable);

        assert!(Cli::try_parse_from(["framebridge", "run", "-i", "a.png", "--frames", "0"]).is_err());
    }

    #[test]
    fn run_rejects_zero_target_height() {
        let zero = ["framebridge", "run", "-i", "a.png", "--target-height", "0"];
        assert!(Cli::try_parse_from(zero).is_err());

        let cli = Cli::try_parse_from(["framebridge", "run", "-i", "a.png", "--target-height", "1"])
            .expect("parse");
        let Commands::Run(run) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.target_height, Some(1));
    }

    #[test]
    fn models_accepts_dir_and_json() {
        let cli = Cli::try_parse_from(["framebridge", "models", "--dir", "m", "--json"])
            .expect("parse models");
        let Commands::Models(args) = cli.command else {
            panic!("expected models subcommand");
        };
        assert_eq!(args.dir, Some(PathBuf::from("m")));
        assert!(args.json);
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["framebridge"]).is_err());
        assert!(Cli::try_parse_from(["framebridge", "probe"]).is_ok());
        assert!(Cli::try_parse_from(["framebridge", "devices", "--log-filter", "debug"]).is_ok());
    }
}
