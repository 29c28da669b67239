//! FragForge CLI - build gateway fragments from page content
//!
//! Commands: build, check, config
//! Outputs the JSON run report to stdout, logs to stderr
//! Returns 2 on validation failure, 1 on fatal errors

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, Level};

use fragforge_core::{error_chain, telemetry::init_tracing, ConversionPipeline, RunConfig, RunReport};

#[derive(Parser)]
#[command(name = "fragforge-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "FragForge CLI - Gateway Fragment Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the run configuration
    #[arg(short, long, global = true, default_value = "fragforge.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert, validate and publish all fragments
    Build {
        /// Override the configured output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Convert and validate without publishing
    Check {
        /// Also write the report to this file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json, if cli.verbose { Level::DEBUG } else { Level::INFO });

    let mut config = if cli.config.exists() {
        match RunConfig::from_path(&cli.config) {
            Ok(c) => c,
            Err(e) => return fatal(&format!("Failed to load config: {}", error_chain(&e))),
        }
    } else {
        RunConfig::default()
    };

    match cli.command {
        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => fatal(&e.to_string()),
        },

        Commands::Build { output, report } => {
            if let Some(output) = output {
                config.paths.output_dir = output;
            }
            execute(config, report, true)
        }

        Commands::Check { report } => execute(config, report, false),
    }
}

fn execute(config: RunConfig, report_path: Option<PathBuf>, publish: bool) -> ExitCode {
    let mut pipeline = match ConversionPipeline::from_config(config) {
        Ok(p) => p,
        Err(e) => return fatal(&error_chain(&e)),
    };

    let outcome = pipeline.load_content().and_then(|units| {
        if publish {
            pipeline.run(units)
        } else {
            pipeline.check(units)
        }
    });

    match outcome {
        Ok(report) => emit(&report, report_path),
        Err(e) => fatal(&error_chain(&e)),
    }
}

fn emit(report: &RunReport, report_path: Option<PathBuf>) -> ExitCode {
    let json = match serde_json::to_string_pretty(report) {
        Ok(j) => j,
        Err(e) => return fatal(&e.to_string()),
    };
    println!("{json}");

    if let Some(path) = report_path {
        if let Err(e) = fs::write(&path, &json) {
            error!(path = %path.display(), error = %e, "failed to write report");
            return ExitCode::FAILURE;
        }
    }

    if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2) // Validation failure
    }
}

fn fatal(message: &str) -> ExitCode {
    error!("{message}");
    let output = serde_json::json!({
        "passed": false,
        "error": message,
    });
    println!("{output}");
    ExitCode::FAILURE
}
