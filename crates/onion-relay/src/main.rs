//! The `onion-relay` binary: runs one relay node of the overlay until
//! interrupted.

mod cli;

use std::io::IsTerminal as _;

use anyhow::Context;
use clap::Parser;
use safelog::with_safe_logging_suppressed;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::FmtSubscriber;

use onion_relay::config::DEFAULT_LOG_LEVEL;
use onion_relay::{OnionRelay, RelayConfig};

fn main() {
    // Will exit if '--help' used or there's a parse error.
    let cli = cli::Cli::parse();

    if let Err(e) = main_main(cli) {
        with_safe_logging_suppressed(|| tor_error::report_and_exit(e))
    }
}

/// The real main without the error formatting.
fn main_main(cli: cli::Cli) -> anyhow::Result<()> {
    // Register a basic stderr logger until we have enough info to configure the main logger.
    let level: tracing::metadata::Level = cli
        .global
        .log_level
        .map(Into::into)
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .parse("")
        .expect("empty filter directive should be trivially parsable");
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(|| {
            eprint!("onion-relay: ");
            std::io::stderr()
        })
        .finish()
        .init();

    match cli.command {
        cli::Commands::BuildInfo => {
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            // these are set by our build script
            println!("Features: {}", env!("BUILD_FEATURES"));
            println!("Profile: {}", env!("BUILD_PROFILE"));
            println!("Debug: {}", env!("BUILD_DEBUG"));
            println!("Optimization level: {}", env!("BUILD_OPT_LEVEL"));
            println!("Rust version: {}", env!("BUILD_RUSTC_VERSION"));
            println!("Target triple: {}", env!("BUILD_TARGET"));
            println!("Host triple: {}", env!("BUILD_HOST"));
        }
        cli::Commands::Run(args) => start_relay(args, cli.global)?,
    }

    Ok(())
}

/// Load the configuration, then run the relay under the configured logger.
fn start_relay(_args: cli::RunArgs, global_args: cli::GlobalArgs) -> anyhow::Result<()> {
    let config = global_args
        .config()
        .resolve()
        .context("Failed to load configuration")?;

    // The command-line level, if any, wins over the configured filter.
    let directive = match global_args.log_level {
        Some(level) => level.to_string(),
        None => config.logging.console.clone(),
    };
    let filter = EnvFilter::builder()
        .parse(&directive)
        .with_context(|| format!("Failed to parse console logging directive {:?}", directive))?;
    let logger = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(|| {
            eprint!("onion-relay: ");
            std::io::stderr()
        })
        .finish();
    let logger = tracing::Dispatch::new(logger);

    tracing::dispatcher::with_default(&logger, || {
        let runtime = init_runtime().context("Failed to initialize the runtime")?;
        runtime.block_on(run_relay(config))
    })
}

/// Run the relay until Ctrl-C, then shut it down.
async fn run_relay(config: RelayConfig) -> anyhow::Result<()> {
    let relay = OnionRelay::bind(config)
        .await
        .context("Failed to initialize relay")?;
    let handle = relay.launch()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Interrupted; stopping");

    let stats = handle.stats();
    if let Err(e) = handle.shutdown().await {
        tor_error::warn_report!(e, "Unclean shutdown");
    }
    info!(
        "Stopped with {} circuits, {} links, {} streams",
        stats.circuits, stats.links, stats.streams
    );
    Ok(())
}

/// Initialize a runtime.
fn init_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("onion-relay")
        .build()
        .inspect_err(|e| warn!("Could not build runtime: {e}"))
}
