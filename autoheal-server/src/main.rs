use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, Level};

use autoheal_core::create_fix_suggester;
use autoheal_server::config::Config;
use autoheal_server::git::GitCommitter;
use autoheal_server::github::GitHubClient;
use autoheal_server::{app, AppState, AutoHealer, RecordingLogger, SqliteStore, WebhookRouter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting CI auto-heal service");

    let config = Config::from_env().context("Failed to load configuration")?;

    let recording_logger = if config.recording_enabled {
        info!(
            "Recording enabled, logging to: {}",
            config.recording_log_path
        );
        Some(RecordingLogger::new(PathBuf::from(&config.recording_log_path)))
    } else {
        None
    };

    let github_app = config.github_app()?;
    let github_client = GitHubClient::new(
        github_app.app_id,
        github_app.private_key.clone(),
        recording_logger.clone(),
    )?;

    let suggester = create_fix_suggester(config.provider_config()?, recording_logger.clone())?;

    let db_path = config.state_db_path();
    info!("Using state database: {}", db_path.display());
    let store = Arc::new(SqliteStore::new(&db_path).context("Failed to initialize SQLite database")?);

    let healer = AutoHealer::new(
        store.clone(),
        suggester,
        Arc::new(GitCommitter::new(config.git.clone())),
        config.heal.clone(),
    )
    .with_ci_host(Arc::new(github_client));

    info!(
        "Healing checkout at {} (max retries {}, min confidence {:.0}%, auto-apply {}, dry run {})",
        config.heal.repo_dir.display(),
        config.heal.max_retries,
        config.heal.min_confidence * 100.0,
        config.heal.auto_apply,
        config.heal.dry_run
    );

    let router = WebhookRouter::new(
        config.webhook_secret()?.to_string(),
        store.clone(),
        Arc::new(healer),
        config.heal.dry_run,
    );

    let app_state = Arc::new(AppState {
        router: Arc::new(router),
        store,
        recording_logger,
        status_auth_token: config.status_auth_token.clone(),
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app(app_state)).await?;

    Ok(())
}
