//! CLI Entry Point for rust-gator
//!
//! Provides command-line access to the alignment core:
//! - `solve`: fit a calibration matrix from a CSV of correspondences
//! - `transform`: map a point through a saved matrix (either direction)
//! - `simulate`: run a full session against mock hardware and visit design points
//!
//! # Usage
//!
//! ```bash
//! rust_gator solve --points marks.csv --output calib_mat.txt --json
//! rust_gator transform --matrix calib_mat.txt 1250 300
//! rust_gator simulate --config config/default.toml 0,0 1250,300
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_gator::calibration::{
    read_correspondences, AffineTransform, CalibrationEngine, FitQuality, DEFAULT_MAX_CONDITION,
};
use rust_gator::config::GatorConfig;
use rust_gator::geometry::{DesignPoint, StagePoint};
use rust_gator::hardware::mock::MockFactory;
use rust_gator::logging::{self, OutputFormat, TracingConfig};
use rust_gator::session::Session;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rust_gator")]
#[command(about = "Design-to-stage calibration and supervised stage motion", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a calibration matrix from correspondences
    Solve {
        /// CSV with columns design_x, design_y, stage_x, stage_y
        #[arg(long)]
        points: PathBuf,

        /// Where to write the matrix
        #[arg(long, default_value = "calib_mat.txt")]
        output: PathBuf,

        /// Condition number ceiling
        #[arg(long, default_value_t = DEFAULT_MAX_CONDITION)]
        max_condition: f64,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Map a point through a saved matrix
    Transform {
        /// Saved calibration matrix
        #[arg(long)]
        matrix: PathBuf,

        /// Map stage coordinates back to design coordinates
        #[arg(long)]
        inverse: bool,

        /// Horizontal coordinate
        #[arg(allow_negative_numbers = true)]
        x: f64,

        /// Vertical coordinate
        #[arg(allow_negative_numbers = true)]
        y: f64,
    },

    /// Run a session against simulated hardware
    Simulate {
        /// Session configuration
        #[arg(long, default_value = "config/default.toml")]
        config: PathBuf,

        /// Solve the calibration from this CSV before moving
        #[arg(long)]
        calibrate: Option<PathBuf>,

        /// Design points to visit, as x,y
        #[arg(value_parser = parse_point, allow_negative_numbers = true)]
        targets: Vec<DesignPoint>,
    },
}

fn parse_point(s: &str) -> Result<DesignPoint, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got '{}'", s))?;
    let x: f64 = x.trim().parse().map_err(|_| format!("invalid x in '{}'", s))?;
    let y: f64 = y.trim().parse().map_err(|_| format!("invalid y in '{}'", s))?;
    Ok(DesignPoint::new(x, y))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = cli
        .log_format
        .as_deref()
        .map(str::parse::<OutputFormat>)
        .transpose()?;

    match cli.command {
        Commands::Solve {
            points,
            output,
            max_condition,
            json,
        } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), format.unwrap_or_default())?;
            solve(points, output, max_condition, json)
        }
        Commands::Transform {
            matrix,
            inverse,
            x,
            y,
        } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), format.unwrap_or_default())?;
            transform(matrix, inverse, x, y)
        }
        Commands::Simulate {
            config,
            calibrate,
            targets,
        } => {
            let config = GatorConfig::load_from(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let mut tracing_config = TracingConfig::from_application(&config.application)?;
            if let Some(level) = cli.log_level.as_deref() {
                tracing_config.level = logging::parse_log_level(level)?;
            }
            if let Some(format) = format {
                tracing_config.format = format;
            }
            logging::init(tracing_config)?;
            simulate(config, calibrate, targets).await
        }
    }
}

fn init_logging(level: &str, format: OutputFormat) -> Result<()> {
    logging::init(TracingConfig::new(logging::parse_log_level(level)?).with_format(format))?;
    Ok(())
}

#[derive(Serialize)]
struct SolveSummary<'a> {
    correspondences: usize,
    matrix: AffineTransform,
    fit: Option<FitQuality>,
    output: &'a Path,
}

fn solve(points: PathBuf, output: PathBuf, max_condition: f64, json: bool) -> Result<()> {
    let file = std::fs::File::open(&points)
        .with_context(|| format!("opening {}", points.display()))?;
    let correspondences = read_correspondences(file)?;

    let mut engine = CalibrationEngine::with_max_condition(max_condition)?;
    for c in &correspondences {
        engine.add_correspondence(c.design, c.stage)?;
    }
    let transform = engine.solve()?;
    engine.save(&output)?;

    if json {
        let summary = SolveSummary {
            correspondences: correspondences.len(),
            matrix: transform,
            fit: engine.fit_quality(),
            output: &output,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let [a, b, c, d, e, f] = transform.to_row_major();
    println!("Solved from {} correspondences", correspondences.len());
    println!("  [{:>14.6e} {:>14.6e} {:>14.6e}]", a, b, c);
    println!("  [{:>14.6e} {:>14.6e} {:>14.6e}]", d, e, f);
    if let Some(fit) = engine.fit_quality() {
        println!(
            "  rms residual {:.3e}, max residual {:.3e}, condition {:.3e}",
            fit.rms_residual, fit.max_residual, fit.condition_number
        );
    }
    println!("Saved to {}", output.display());
    Ok(())
}

fn transform(matrix: PathBuf, inverse: bool, x: f64, y: f64) -> Result<()> {
    let mut engine = CalibrationEngine::new();
    engine.load(&matrix)?;
    if inverse {
        let design = engine.inverse_transform(StagePoint::new(x, y))?;
        println!("{} {}", design.x, design.y);
    } else {
        let stage = engine.transform(DesignPoint::new(x, y))?;
        println!("{} {}", stage.x, stage.y);
    }
    Ok(())
}

async fn simulate(
    config: GatorConfig,
    calibrate: Option<PathBuf>,
    targets: Vec<DesignPoint>,
) -> Result<()> {
    let factory = Arc::new(MockFactory::from_config(&config));
    let session = Session::open(config, factory).await?;

    let outcome = visit(&session, calibrate, targets).await;
    session.shutdown().await;
    outcome
}

async fn visit(
    session: &Session,
    calibrate: Option<PathBuf>,
    targets: Vec<DesignPoint>,
) -> Result<()> {
    if !session.wait_for_positions(Duration::from_secs(2)).await {
        bail!("stage axes did not report a position");
    }

    if let Some(path) = calibrate {
        let file =
            std::fs::File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut calibration = session.calibration().write();
        calibration.clear();
        for c in read_correspondences(file)? {
            calibration.add_correspondence(c.design, c.stage)?;
        }
        calibration.solve()?;
    }

    for target in targets {
        let stage = session
            .planner()
            .move_to_design_point(target, None, None)
            .await
            .with_context(|| format!("moving to design point {}", target))?;
        let actual = session.stage().current_position()?;
        println!("design {} -> stage {} (reached {})", target, stage, actual);
    }

    for health in session.health() {
        println!(
            "{}: {} (dropped {} messages)",
            health.device, health.state, health.dropped_messages
        );
    }
    Ok(())
}
