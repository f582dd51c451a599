//! `visualaid` CLI - segment a photo or estimate its depth.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use visualaid::image::{load_image_file, save_image};
use visualaid::{Config, ModelKind, Pipeline, SessionState, Visualization};

/// Which analysis to run.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum AnalysisMode {
    /// Semantic segmentation overlay with a class legend.
    Segmentation,
    /// Grayscale relative depth.
    Depth,
    /// Depth with a channel-last model export.
    DepthNhwc,
}

impl From<AnalysisMode> for ModelKind {
    fn from(mode: AnalysisMode) -> Self {
        match mode {
            AnalysisMode::Segmentation => Self::Segformer,
            AnalysisMode::Depth => Self::DepthAnything,
            AnalysisMode::DepthNhwc => Self::DepthAnythingChannelLast,
        }
    }
}

/// Segment a photo into labeled regions or render its relative depth.
#[derive(Parser, Debug)]
#[command(name = "visualaid")]
#[command(version, about, long_about = None)]
struct Args {
    /// Input image path.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output image path (PNG or JPEG by extension).
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Analysis to run.
    #[arg(short, long, value_enum, default_value = "segmentation")]
    mode: AnalysisMode,

    /// Bundled model file. Copied into the model cache on first use.
    #[arg(long, value_name = "PATH")]
    model: PathBuf,

    /// Model cache directory. Defaults to the platform cache directory.
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Run on CPU only.
    #[arg(long)]
    no_accel: bool,

    /// Overlay weight of the segmentation mask (0.0-1.0).
    #[arg(short, long, default_value = "0.75", value_name = "FLOAT")]
    alpha: f32,

    /// Output JPEG quality (1-100).
    #[arg(short, long, default_value = "95", value_name = "INT")]
    quality: u8,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("visualaid={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(&args) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: &Args) -> Result<()> {
    if !args.input.exists() {
        anyhow::bail!("Input file does not exist: {}", args.input.display());
    }

    let config = Config {
        model: args.mode.into(),
        blend_alpha: args.alpha,
        acceleration: !args.no_accel,
        cache_dir: args.cache_dir.clone(),
        ..Config::default()
    };

    let pipeline = Pipeline::new(config).context("Failed to initialize pipeline")?;
    pipeline
        .load_bundled_in_background(&args.model, |_| {})
        .context("Failed to start model load")?;

    // Decode while the model loads
    let image = load_image_file(&args.input)
        .with_context(|| format!("Failed to decode {}", args.input.display()))?;

    wait_for_model(&pipeline)?;

    let analysis = pipeline
        .analyze(&image)
        .context("Failed to analyze image")?;

    save_image(analysis.visualization.image(), &args.output, args.quality)
        .context("Failed to save result")?;

    if let Visualization::Segmentation { legend, .. } = &analysis.visualization {
        println!("Detected classes:");
        for entry in legend {
            let [r, g, b] = entry.color.0;
            println!("  #{r:02x}{g:02x}{b:02x}  {}", entry.label);
        }
    }

    println!("{}", analysis.timings.inference_text());
    println!("{}", analysis.timings.total_text());
    println!(
        "Successfully processed {} -> {}",
        args.input.display(),
        args.output.display()
    );

    Ok(())
}

fn wait_for_model(pipeline: &Pipeline) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message(format!("Loading {}", pipeline.model().name()));

    let state = loop {
        match pipeline.model().wait_timeout(Duration::from_millis(100)) {
            SessionState::Loading => spinner.tick(),
            settled => break settled,
        }
    };
    spinner.finish_and_clear();

    match state {
        SessionState::Ready => Ok(()),
        other => anyhow::bail!("Model {} is {other}", pipeline.model().name()),
    }
}
