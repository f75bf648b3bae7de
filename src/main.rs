use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crt::ascii_render::{GlyphRamp, DEFAULT_GAMMA};
use crt::decoding;
use crt::play::{self, PlayArgs};

#[derive(Debug, Parser)]
#[command(name = "crt")]
#[command(version = build_version())]
#[command(about = "Real-time ASCII video playback in the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Play a video file as animated ASCII art.
    Play {
        input: PathBuf,
        /// Gamma exponent applied to normalized brightness.
        #[arg(long, default_value_t = DEFAULT_GAMMA)]
        gamma: f32,
        /// Glyph ramp: default (10 steps) or dense (69 steps).
        #[arg(long, default_value = "default")]
        ramp: String,
        /// Start paused; space resumes.
        #[arg(long)]
        paused: bool,
        /// 1-based frame to start from.
        #[arg(long, default_value_t = 1)]
        start_frame: u32,
        /// Overlay difference-of-Gaussians edges on the picture.
        #[arg(long)]
        edges: bool,
    },
    /// Probe a video file and print its metadata.
    Probe {
        input: PathBuf,
        /// Emit the metadata as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn build_version() -> &'static str {
    let version = match option_env!("CRT_GIT_HASH") {
        Some(hash) => format!("{} ({hash})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_owned(),
    };
    Box::leak(version.into_boxed_str())
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Play {
            input,
            gamma,
            ramp,
            paused,
            start_frame,
            edges,
        } => run_play(input, gamma, &ramp, paused, start_frame, edges),
        Commands::Probe { input, json } => run_probe(input, json),
    };

    if let Err(error) = result {
        eprintln!("[crt] error: {error:#}");
        std::process::exit(1);
    }
}

fn run_play(
    input: PathBuf,
    gamma: f32,
    ramp: &str,
    paused: bool,
    start_frame: u32,
    edges: bool,
) -> Result<()> {
    if !input.exists() {
        bail!("file '{}' could not be found", input.display());
    }
    if !(gamma > 0.0 && gamma <= 10.0) {
        bail!("gamma must be in (0, 10], got {gamma}");
    }
    let ramp = GlyphRamp::from_keyword(ramp)?;

    play::run_play(
        &input,
        PlayArgs {
            gamma,
            ramp,
            paused,
            start_frame,
            edges,
        },
    )
}

fn run_probe(input: PathBuf, json: bool) -> Result<()> {
    if !input.exists() {
        bail!("file '{}' could not be found", input.display());
    }
    let metadata = decoding::probe(&input)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    } else {
        println!(
            "OK: {} ({}x{}, {:.2} fps, {} frames, {:.1}s)",
            input.display(),
            metadata.width,
            metadata.height,
            metadata.fps,
            metadata.total_frames,
            metadata.duration().as_secs_f64(),
        );
    }
    Ok(())
}
