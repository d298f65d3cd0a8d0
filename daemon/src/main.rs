/// Delegate agent - Main entry point
/// Registers with the manager and runs tasks until stopped
use clap::Parser;
use delegate_core::TaskFactoryRegistry;
use delegate_daemon::{DelegateConfig, DelegateService, HttpManagerClient, ShellScriptFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "delegate-daemon",
    about = "Task dispatch agent that executes work handed out by a manager",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// Manager URL
    #[arg(
        short,
        long,
        value_name = "URL",
        help = "Manager API base URL (overrides manager.url)"
    )]
    manager_url: Option<String>,

    /// Account id
    #[arg(
        short,
        long,
        value_name = "ID",
        help = "Account id (overrides manager.account_id)"
    )]
    account_id: Option<String>,

    /// Polling mode
    #[arg(long, help = "Poll for task events instead of streaming")]
    polling: bool,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => DelegateConfig::load(&path.to_string_lossy())?,
        None => DelegateConfig::default(),
    };

    // Apply CLI overrides
    if let Some(url) = args.manager_url {
        config.manager.url = url;
    }
    if let Some(account_id) = args.account_id {
        config.manager.account_id = account_id;
    }
    if let Ok(secret) = std::env::var("DELEGATE_ACCOUNT_SECRET") {
        config.manager.account_secret = secret;
    }
    if args.polling {
        config.agent.polling_mode = true;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // Setup logging
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::from_default_env().add_directive(log_level.parse()?);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(true)
            .init();
    }

    info!("Starting delegate v{}", delegate_daemon::VERSION);
    match &args.config {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }

    // Validate configuration
    config.validate()?;

    info!(
        "Manager: {} (account {}, {} mode)",
        config.manager.url,
        config.manager.account_id,
        if config.agent.polling_mode { "polling" } else { "streaming" }
    );

    let client = Arc::new(HttpManagerClient::new(&config.manager)?);
    let factories = Arc::new(TaskFactoryRegistry::new().with_factory(Arc::new(ShellScriptFactory)));
    let service = DelegateService::new(config, client, factories)?;
    let state = service.state();

    // Setup signal handling for graceful shutdown
    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for CTRL+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {
                info!("Received CTRL+C signal");
            },
            () = terminate => {
                info!("Received SIGTERM signal");
            },
        }

        signal_state.stop();
    });

    if let Err(e) = service.run().await {
        error!("Delegate failed: {}", e);
        std::process::exit(1);
    }

    info!("Delegate stopped");
    Ok(())
}
