//! warehouse-etl CLI

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use warehouse_etl::config::{LogFormat, LoggingConfig};
use warehouse_etl::{EtlConfig, JobCommand, JobPhase, JobReport, Pipeline, TimeWindow};

const DEFAULT_CONFIG_FILES: [&str; 2] = ["warehouse-etl.toml", ".warehouse-etl.toml"];

#[derive(Parser)]
#[command(name = "warehouse-etl")]
#[command(author, version, about = "Batch ETL jobs loading sources into an analytical warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format
    #[arg(long, global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a document-store collection
    Mongo {
        /// Job name
        #[arg(short = 'j', long = "job_name")]
        job_name: String,
        /// Window start, epoch seconds
        #[arg(short = 's', long = "start_date")]
        start_date: Option<i64>,
        /// Window end, epoch seconds
        #[arg(short = 'e', long = "end_date")]
        end_date: Option<i64>,
        /// Move the window start back by the job's reload days
        #[arg(short = 'r', long)]
        reload: bool,
    },
    /// Extract a relational table
    Relational {
        /// Job name
        #[arg(short = 'j', long = "job_name")]
        job_name: String,
    },
    /// Extract a REST API service
    Api {
        /// Job name
        #[arg(short = 'j', long = "job_name")]
        job_name: String,
    },
    /// Run a transformation inside the warehouse
    Transform {
        /// Job name
        #[arg(short = 'j', long = "job_name")]
        job_name: String,
    },
    /// Generate sample config
    Init {
        #[arg(short, long, default_value = "warehouse-etl.toml")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate config and job metadata
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Handle init command first - it doesn't need config
    if let Commands::Init { output, force } = &cli.command {
        init_logging(&LoggingConfig::default(), &cli);
        return match run_init(output, *force) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let config = load_config(cli.config.as_deref());
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(&logging, &cli);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(code = e.code(), "Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let command = match cli.command {
        Commands::Validate => return run_validate(&config, cli.json),
        Commands::Init { .. } => unreachable!(), // Handled above
        Commands::Mongo {
            job_name,
            start_date,
            end_date,
            reload,
        } => JobCommand::Document {
            job_name,
            window: TimeWindow {
                start: start_date,
                end: end_date,
                reload,
            },
        },
        Commands::Relational { job_name } => JobCommand::Relational { job_name },
        Commands::Api { job_name } => JobCommand::Api { job_name },
        Commands::Transform { job_name } => JobCommand::Transform { job_name },
    };

    let report = run_job(config, &command, cli.json, cli.quiet).await;
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn load_config(path: Option<&Path>) -> warehouse_etl::Result<EtlConfig> {
    let default = DEFAULT_CONFIG_FILES
        .iter()
        .map(Path::new)
        .find(|p| p.exists());
    EtlConfig::load(path.or(default))
}

async fn run_job(config: EtlConfig, command: &JobCommand, json: bool, quiet: bool) -> JobReport {
    let interactive = !quiet && !json;
    if interactive {
        println!("warehouse-etl v{}", warehouse_etl::VERSION);
        println!("Running {}\n", command);
    }

    let mut pipeline = Pipeline::new(config);
    if let Some(bar) = interactive.then(progress_bar) {
        pipeline = pipeline.with_progress(move |p| {
            if let Some(total) = p.total {
                bar.set_length(total);
            }
            bar.set_position(p.done);
            bar.set_message(format!("{} ({} records)", p.phase, p.records));
            if matches!(p.phase, JobPhase::Completed | JobPhase::Failed) {
                bar.finish_and_clear();
            }
        });
    }

    let report = pipeline.run(command).await;

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{}", out),
            Err(e) => error!("Failed to render report: {}", e),
        }
    } else if !quiet {
        print_report(&report);
    }
    report
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar
}

fn print_report(report: &JobReport) {
    if report.is_success() {
        println!("{} Job completed successfully", style("✓").green());
    } else {
        println!("{} Job failed", style("✗").red());
    }
    println!("\nRun id: {}", report.run_id);
    println!("Duration: {}ms", report.duration_ms);
    println!(
        "Records: {} extracted, {} loaded, {} field errors",
        report.metrics.records_extracted, report.metrics.records_loaded, report.metrics.field_errors
    );
    if let Some(message) = &report.message {
        println!("      Error: {}", style(message).red());
    }
}

fn run_validate(config: &EtlConfig, json: bool) -> ExitCode {
    match config.check_jobs() {
        Ok(()) => {
            if json {
                println!(
                    r#"{{"valid":true,"jobs":{},"transformations":{}}}"#,
                    config.jobs.len(),
                    config.transformations.len()
                );
            } else {
                println!(
                    "{} Configuration valid: {} jobs, {} transformations",
                    style("✓").green(),
                    config.jobs.len(),
                    config.transformations.len()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(code = e.code(), "Invalid configuration: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_init(output: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if output.exists() && !force {
        return Err(format!("{} already exists (use --force)", output.display()).into());
    }
    std::fs::write(output, EtlConfig::sample_toml())?;
    println!("✓ Created: {}", output.display());
    println!("\nEdit the file or use environment variables:");
    println!(
        "  {}, {}, {}",
        warehouse_etl::config::CONFIG_B64_ENV,
        warehouse_etl::config::WAREHOUSE_URL_ENV,
        warehouse_etl::motherduck::MOTHERDUCK_TOKEN_ENV
    );
    info!("Wrote sample configuration to {}", output.display());
    Ok(())
}

fn init_logging(logging: &LoggingConfig, cli: &Cli) {
    if cli.quiet {
        return;
    }
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let format = match cli.log_format.as_deref() {
        Some("json") => LogFormat::Json,
        Some(_) => LogFormat::Text,
        None => logging.format,
    };

    // When JSON output is enabled, send logs to stderr to avoid mixing with JSON on stdout
    let builder = fmt().with_env_filter(filter).with_target(false);
    match (format, cli.json) {
        (LogFormat::Json, true) => builder.json().with_writer(std::io::stderr).init(),
        (LogFormat::Json, false) => builder.json().init(),
        (LogFormat::Text, true) => builder.with_writer(std::io::stderr).init(),
        (LogFormat::Text, false) => builder.init(),
    }
}
