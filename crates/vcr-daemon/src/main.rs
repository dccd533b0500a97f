//! Daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vcr_core::attest::AttestSigner;
use vcr_core::config::Config;

use vcr_daemon::analyzer::CommandAnalyzer;
use vcr_daemon::chain::{ChainReader, RpcChainReader};
use vcr_daemon::fetcher::GitFetcher;
use vcr_daemon::http::{self, ApiState};
use vcr_daemon::poller::{Poller, PollerSettings};
use vcr_daemon::resolver::HttpResolver;
use vcr_daemon::scheduler::BuildQueue;
use vcr_daemon::store::Store;

#[derive(Parser)]
#[command(name = "vcr-daemon", about = "Verifiable code reports daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watcher, build queue, and operator API.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "vcr.toml")]
        config: PathBuf,
    },
    /// Generate a fresh signing key seed and print its address.
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Run { config } => run(config).await,
        Command::Keygen => {
            keygen();
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = if config_path.exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        Config::default()
    };

    let seed = Config::signer_seed_from_env()?;
    let signer = Arc::new(AttestSigner::from_seed_hex(&seed)?);
    info!(signer = %signer.address(), "attestation signer loaded");

    let store = Store::open(&config.daemon.db_path)
        .with_context(|| format!("opening {}", config.daemon.db_path.display()))?;

    let queue = BuildQueue::start(
        store.clone(),
        Arc::new(GitFetcher::new(config.fetcher.clone())),
        Arc::new(CommandAnalyzer::new(config.analyzer.clone())),
        Arc::clone(&signer),
        config.daemon.max_concurrent,
        config.daemon.max_retries,
    );
    queue.resume_pending().context("resuming pending builds")?;

    let chain: Arc<dyn ChainReader> = Arc::new(RpcChainReader::new(
        config.chain.rpc_url.clone(),
        config.chain.app_controller.clone(),
    ));
    let poller = Poller::new(
        store.clone(),
        Arc::clone(&chain),
        Arc::new(HttpResolver::new(&config.resolver)),
        Arc::new(queue.clone()),
        PollerSettings {
            poll_interval: config.daemon.poll_interval(),
            start_block: config.chain.start_block,
            block_buffer: config.chain.block_buffer,
            resolver_call_delay: config.resolver.call_delay(),
        },
    );
    tokio::spawn(poller.run());

    let router = http::router(ApiState {
        store,
        queue,
        chain,
        signer_address: signer.address().to_string(),
    });
    let listener = tokio::net::TcpListener::bind(&config.daemon.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.daemon.bind_addr))?;
    info!(addr = %config.daemon.bind_addr, "operator api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("ctrl-c received, shutting down");
    }
}

/// Prints a fresh seed and its derived signer address. The seed goes into
/// the `VCR_SIGNER_KEY` environment variable.
fn keygen() {
    let signer = AttestSigner::generate();
    println!("seed:    {}", signer.seed_hex());
    println!("address: {}", signer.address());
}
