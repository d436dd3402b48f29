use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;

use autoheal_core::create_fix_suggester;
use autoheal_server::config::Config;
use autoheal_server::git::GitCommitter;
use autoheal_server::store::AttemptKey;
use autoheal_server::{AutoHealer, RetryStore, SqliteStore};

/// autoheal: machine-generated fixes for failing CI runs
#[derive(Parser, Debug)]
#[command(name = "autoheal")]
#[command(about = "Apply machine-generated fixes to failing commits", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask for a fix for a commit given its error output, and apply it
    Heal(HealArgs),
    /// List tracked retry attempts
    Attempts,
    /// Stop healing a commit
    Cancel(CancelArgs),
}

#[derive(Parser, Debug)]
struct HealArgs {
    /// Repository owner
    owner: String,
    /// Repository name
    repo: String,
    /// Commit SHA that failed
    commit: String,
    /// Error output to hand to the fix provider
    error_message: String,

    /// Report the suggested fix without writing files or committing
    #[arg(long)]
    dry_run: bool,

    /// Repository checkout to apply the fix to (defaults to REPO_DIR)
    #[arg(long)]
    repo_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct CancelArgs {
    owner: String,
    repo: String,
    commit: String,
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::new(config.state_db_path()).with_context(|| {
        format!(
            "Failed to open state database {}",
            config.state_db_path().display()
        )
    })?;
    Ok(Arc::new(store))
}

async fn run_heal(config: Config, args: HealArgs) -> Result<bool> {
    let mut heal = config.heal.clone();
    if let Some(repo_dir) = args.repo_dir {
        heal.repo_dir = repo_dir;
    }

    let suggester = create_fix_suggester(config.provider_config()?, None)?;
    let healer = AutoHealer::new(
        open_store(&config)?,
        suggester,
        Arc::new(GitCommitter::new(config.git.clone())),
        heal,
    );

    let outcome = healer
        .manual_trigger(
            &args.owner,
            &args.repo,
            &args.commit,
            &args.error_message,
            args.dry_run,
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(outcome.is_success())
}

async fn run_attempts(config: Config) -> Result<()> {
    let attempts = open_store(&config)?.list_attempts().await?;
    if attempts.is_empty() {
        println!("No retry attempts recorded.");
        return Ok(());
    }

    for attempt in attempts {
        println!(
            "{:<40} {:<10} attempts={} run={} {}",
            attempt.key().to_string(),
            attempt.status,
            attempt.attempt_count,
            attempt
                .workflow_run_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            attempt.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn run_cancel(config: Config, args: CancelArgs) -> Result<bool> {
    let key = AttemptKey::new(&args.owner, &args.repo, &args.commit);
    match open_store(&config)?.cancel(&key).await? {
        Some(attempt) => {
            println!("{} is now {}", key, attempt.status);
            Ok(true)
        }
        None => {
            eprintln!("No retry attempt recorded for {}", key);
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    let succeeded = match cli.command {
        Commands::Heal(args) => run_heal(config, args).await?,
        Commands::Attempts => {
            run_attempts(config).await?;
            true
        }
        Commands::Cancel(args) => run_cancel(config, args).await?,
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
