use clap::{Parser, Subcommand};

mod commands;

use commands::{GridArgs, JobsArgs, ShowArgs, SubmitArgs, WalkForwardArgs, WindowsArgs};

#[derive(Parser)]
#[command(name = "stratlab")]
#[command(about = "Parameter optimization and walk-forward analysis for trading strategies", long_about = None)]
struct Cli {
    /// Configuration profile layered over config/Config.toml
    #[arg(long, global = true, env = "STRATLAB_PROFILE")]
    profile: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an optimization job and wait for it to finish
    Optimize(SubmitArgs),
    /// Run a walk-forward job and wait for it to finish
    WalkForward(WalkForwardArgs),
    /// Expand a request's parameter grid without running anything
    Grid(GridArgs),
    /// Print the walk-forward folds for a date span
    Windows(WindowsArgs),
    /// List stored jobs, newest first
    Jobs(JobsArgs),
    /// Show a stored job and its best variants
    Show(ShowArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if let Some(path) = &cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let profile = cli.profile.as_deref();
    match cli.command {
        Commands::Optimize(args) => commands::run_optimize(args, profile).await?,
        Commands::WalkForward(args) => commands::run_walk_forward(args, profile).await?,
        Commands::Grid(args) => commands::run_grid(&args, profile)?,
        Commands::Windows(args) => commands::run_windows(&args)?,
        Commands::Jobs(args) => commands::run_jobs(args, profile).await?,
        Commands::Show(args) => commands::run_show(args, profile).await?,
    }

    Ok(())
}
