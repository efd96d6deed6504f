//! ForceQuit helper entry point.
//!
//! `serve` runs the daemon; `check` validates a config file and exits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use forcequit::audit::{AuditEvent, AuditKind, AuditLog, Decision};
use forcequit::config::DEFAULT_HELPER_CONFIG_PATH;
use forcequit::policy::{PolicyTables, SafetyClassifier};
use forcequit::process::signature::client_verifier;
use forcequit::process::sysinfo_host::SysinfoHost;
use forcequit::process::ProcessHost;
use forcequit::terminate::Orchestrator;

use forcequit_helper::auth::SignatureAuthenticator;
use forcequit_helper::config::{load_helper_config, HelperConfig};
use forcequit_helper::handler::RequestHandler;
use forcequit_helper::power::SystemPower;
use forcequit_helper::server::{self, HelperServer, ServerSettings};

/// Privileged helper for ForceQuit.
#[derive(Parser)]
#[command(name = "forcequit-helper", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the helper daemon.
    Serve {
        /// Config file.
        #[arg(long, default_value = DEFAULT_HELPER_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Validate a config file and print the effective settings.
    Check {
        /// Config file.
        #[arg(long, default_value = DEFAULT_HELPER_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => handle_serve(config).await,
        Command::Check { config } => handle_check(config),
    }
}

/// Run the helper daemon until SIGTERM or Ctrl-C.
async fn handle_serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_helper_config(&config_path)?;
    let _logging_guard =
        forcequit::logging::init_production(&config.paths.logs_dir, "forcequit-helper")?;

    let audit = Arc::new(AuditLog::open(&config.paths.audit_file)?);
    audit.record(AuditEvent::new(
        "helper",
        Decision::Info,
        "helper started",
        AuditKind::Startup {
            version: env!("CARGO_PKG_VERSION").to_owned(),
        },
    ));
    if config.clients.allowed.is_empty() {
        warn!("no allowed clients configured; every connection will be rejected");
    }

    let verifier = client_verifier(&config.clients.allowed);
    let host: Arc<dyn ProcessHost> = Arc::new(SysinfoHost::new(Arc::clone(&verifier)));
    let tables = PolicyTables::native()
        .with_protected_names(config.policy.extra_protected_names.iter())
        .with_preserved_names(config.policy.preserved_names.iter());
    let classifier = Arc::new(SafetyClassifier::new(tables, std::process::id()));

    let orchestrator = Orchestrator::new(
        Arc::clone(&host),
        classifier,
        config.termination.settings(),
        Arc::clone(&audit),
        "helper",
    );
    let handler = Arc::new(RequestHandler::new(
        orchestrator,
        Arc::new(SystemPower),
        Arc::clone(&audit),
    ));
    let authenticator = Arc::new(SignatureAuthenticator::new(
        host,
        verifier,
        config.clients.allowed.clone(),
        config.clients.capabilities.clone(),
    ));

    let helper = Arc::new(HelperServer::new(
        ServerSettings {
            max_connections: config.server.max_connections,
            idle_timeout: config.server.idle_timeout(),
            max_frame_bytes: config.server.max_frame_bytes,
        },
        authenticator,
        handler,
        audit,
    ));

    let listener = server::bind(&config.server.socket_path)?;
    info!(
        socket = %config.server.socket_path.display(),
        clients = config.clients.allowed.len(),
        "helper started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    helper.run(listener, shutdown_rx).await;

    if let Err(e) = std::fs::remove_file(&config.server.socket_path) {
        warn!(error = %e, "failed to remove socket");
    }
    info!("helper stopped");
    Ok(())
}

/// Validate a config file.
fn handle_check(config_path: PathBuf) -> anyhow::Result<()> {
    forcequit::logging::init_cli();
    let config: HelperConfig = load_helper_config(&config_path)
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    println!("socket:          {}", config.server.socket_path.display());
    println!("max connections: {}", config.server.max_connections);
    println!("idle timeout:    {}s", config.server.idle_timeout_secs);
    println!("allowed clients: {}", config.clients.allowed.join(", "));
    let caps: Vec<&str> = config.clients.capabilities.iter().map(|c| c.as_str()).collect();
    println!("capabilities:    {}", caps.join(", "));
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received Ctrl-C"),
    }
}
