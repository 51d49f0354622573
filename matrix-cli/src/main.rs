mod commands;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Run GitHub Actions style matrix workflows locally
#[derive(Parser, Debug)]
#[command(name = "matrix-ci", version, about)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "MATRIX_CI_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every matrix instance the event triggers
    Run(commands::run::RunArgs),
    /// Show whether the event triggers the workflow and what would run
    Plan(commands::plan::PlanArgs),
    /// Parse and validate a workflow file
    Validate(commands::validate::ValidateArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("matrix_service={level},matrix_ci={level}")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Plan(args) => commands::plan::execute(args),
        Command::Validate(args) => commands::validate::execute(args),
    }
}
