//! TaskGate entry point.
//!
//! Resolves configuration (file, then `TASKGATE_*` environment, then
//! flags), installs logging and signal handlers, and hands off to
//! [`taskgate::server::run`].

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use taskgate::cli::{Cli, describe_secret};
use taskgate::{logging, server};
use taskgate_core::config::GatewayConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("taskgate: {e}");
            std::process::exit(1);
        }
    };

    if cli.check {
        print_summary(&config);
        return;
    }

    let log_guard = logging::init(&config.logging, config.transport.mode);

    let signal = CancellationToken::new();
    setup_signal_handlers(signal.clone());

    let code = match server::run(config, signal).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "TaskGate exited with error");
            eprintln!("taskgate: {e}");
            1
        }
    };

    // process::exit skips destructors; flush buffered log lines first.
    drop(log_guard);
    std::process::exit(code);
}

fn print_summary(config: &GatewayConfig) {
    println!("configuration OK");
    println!("  transport:   {}", config.transport.mode);
    if let Some(port) = config.transport.port {
        println!("  listen:      {}:{port}", config.transport.bind);
    }
    println!("  upstream:    {}", config.upstream.api_base());
    println!("  store:       {:?}", config.store.backend);
    println!(
        "  rate limit:  {} per {}s (enabled: {})",
        config.rate_limit.burst, config.rate_limit.window_secs, config.rate_limit.enabled
    );
    println!(
        "  api token:   {}",
        describe_secret(config.transport.api_token.as_ref())
    );
    if config.admin.enabled {
        println!("  admin port:  {}", config.admin.port);
    }
}

/// SIGINT and SIGTERM both begin a graceful shutdown.
fn setup_signal_handlers(signal: CancellationToken) {
    let on_sigint = signal.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                on_sigint.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        let on_sigterm = signal;
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    on_sigterm.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
            }
        });
    }

    #[cfg(not(unix))]
    let _ = signal;
}
