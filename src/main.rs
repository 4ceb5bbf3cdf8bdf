//! `pdelab` command-line interface.

mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pdelab::PdeError;
use tracing::{Level, error};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "pdelab")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Structured-grid PDE solver with convergence verification", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve one problem described by a JSON file
    Run(commands::run::RunArgs),
    /// Run the convergence verification suite
    Verify(commands::verify::VerifyArgs),
    /// Time the numerical kernels
    Bench(commands::bench::BenchArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {err}");
        return ExitCode::from(commands::EXIT_INTERNAL);
    }

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args),
        Commands::Verify(args) => commands::verify::execute(args),
        Commands::Bench(args) => commands::bench::execute(args),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            let code = match err.downcast_ref::<PdeError>() {
                Some(e) if e.is_configuration() => commands::EXIT_CONFIGURATION,
                _ => commands::EXIT_INTERNAL,
            };
            ExitCode::from(code)
        }
    }
}
