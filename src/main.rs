//! ForceQuit CLI entry point.
//!
//! Subcommands inspect and classify processes, terminate them through the
//! authorization pipeline, sweep non-essential applications, and manage the
//! privileged helper.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use forcequit::audit::AuditLog;
use forcequit::auth::consent::{ConsentNotice, DEFAULT_CONSENT_EXPIRY};
use forcequit::auth::service::{ServiceInstaller, ServiceInstallerConfig};
use forcequit::auth::{Authorizer, AuthorizerDeps, ConsentBroker, ConsentPrompt, StaticConsent};
use forcequit::cancel::{cancel_pair, CancelSignal};
use forcequit::config::{load_config_or_default, Config, RuntimePaths};
use forcequit::engine::{Engine, EngineDeps, EngineError, EngineSettings};
use forcequit::ipc::client::{ClientSettings, UnixSocketConnector};
use forcequit::ipc::HelperClient;
use forcequit::policy::{PolicyTables, SafetyClassifier};
use forcequit::process::signature::platform_verifier;
use forcequit::process::sysinfo_host::SysinfoHost;
use forcequit::process::ProcessHost;
use forcequit::terminate::{TerminationMode, TerminationOutcome};
use forcequit::validation::rules::{default_rules, RuleInputs};
use forcequit::validation::SecurityValidator;

/// Default file name of the helper binary shipped next to the CLI.
const HELPER_BINARY: &str = "forcequit-helper";

/// ForceQuit: terminate processes safely, escalating only with consent.
#[derive(Parser)]
#[command(name = "forcequit", version, about)]
struct Cli {
    /// Config file (default: ~/.forcequit/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Approve every consent prompt for this invocation.
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// List processes with their safety tier.
    List {
        /// Only show foreground processes.
        #[arg(long)]
        foreground: bool,
    },
    /// Classify one process.
    Classify {
        /// Target pid.
        pid: u32,
    },
    /// Terminate a process.
    Kill {
        /// Target pid.
        pid: u32,
        /// How far the termination may escalate.
        #[arg(long, value_enum, default_value_t = ModeArg::Standard)]
        mode: ModeArg,
    },
    /// Force-quit every non-essential foreground application.
    Sweep {
        /// How far each termination may escalate.
        #[arg(long, value_enum, default_value_t = ModeArg::Standard)]
        mode: ModeArg,
    },
    /// Show privilege tier, helper status and security state.
    Status,
    /// Run validation in the foreground and stream audit events.
    Watch,
    /// Restart the machine through the helper.
    Restart,
    /// Manage the privileged helper.
    Helper {
        /// Helper action.
        #[command(subcommand)]
        action: HelperAction,
    },
}

/// Helper management actions.
#[derive(Subcommand)]
enum HelperAction {
    /// Install and start the helper service.
    Install,
    /// Stop and remove the helper service.
    Uninstall,
    /// Show installation status.
    Status,
    /// Query the running helper's health.
    Health,
}

/// Termination mode on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Graceful signal only.
    Graceful,
    /// Graceful, then forced for safe and monitored targets.
    Standard,
    /// Also force restricted system services.
    Escalate,
}

impl From<ModeArg> for TerminationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Graceful => Self::Graceful,
            ModeArg::Standard => Self::Standard,
            ModeArg::Escalate => Self::Escalate,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    forcequit::logging::init_cli();

    let paths = RuntimePaths::resolve()?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file.clone());
    let config = load_config_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let consent: Arc<dyn ConsentPrompt> = if cli.yes {
        Arc::new(StaticConsent::approve_all())
    } else {
        let (broker, notices) = ConsentBroker::new(DEFAULT_CONSENT_EXPIRY);
        let broker = Arc::new(broker);
        tokio::spawn(run_terminal_prompt(Arc::clone(&broker), notices));
        broker
    };

    let engine = Arc::new(build_engine(&config, &paths, consent)?);
    let startup = engine.start().await;
    debug!(
        helper = %startup.helper_status,
        security = %startup.security.state,
        "engine ready"
    );

    let (cancel_handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_handle.cancel();
        }
    });

    let result = dispatch(&engine, cli.command, cancel).await;

    if let Err(e) = engine.persist_hint().await {
        warn!(error = %e, "failed to persist state hint");
    }
    result
}

async fn dispatch(engine: &Arc<Engine>, command: Command, cancel: CancelSignal) -> anyhow::Result<()> {
    match command {
        Command::List { foreground } => {
            for (desc, class) in engine.list() {
                if foreground && !desc.foreground {
                    continue;
                }
                println!("{:>7}  {:<10}  {}", desc.pid, class.tier, desc.name);
            }
            Ok(())
        }
        Command::Classify { pid } => {
            let (desc, class) = engine.classify(pid);
            match desc {
                Some(desc) => println!(
                    "{pid} {}: {} ({})\n  executable: {}",
                    desc.name,
                    class.tier,
                    class.reason,
                    desc.executable
                        .as_deref()
                        .map_or_else(|| "-".to_owned(), |p| p.display().to_string())
                ),
                None => println!("{pid}: {} ({})", class.tier, class.reason),
            }
            Ok(())
        }
        Command::Kill { pid, mode } => {
            let outcome = engine
                .request_termination_with(pid, mode.into(), cancel)
                .await
                .map_err(explain)?;
            print_outcome(&outcome);
            Ok(())
        }
        Command::Sweep { mode } => {
            let report = engine.sweep(mode.into(), cancel).await.map_err(explain)?;
            for outcome in &report.terminated {
                print_outcome(outcome);
            }
            for kept in &report.preserved {
                println!("{:>7}  preserved  {}", kept.pid, kept.name);
            }
            println!(
                "{} terminated, {} preserved",
                report.terminated.iter().filter(|o| o.status.exited()).count(),
                report.preserved.len()
            );
            Ok(())
        }
        Command::Status => {
            let snapshot = engine.snapshot();
            let report = engine.security_report();
            println!("privilege tier: {}", snapshot.tier);
            println!("helper:         {}", snapshot.helper_status);
            println!(
                "security:       {}{}",
                report.state,
                if snapshot.lockdown { " (lockdown)" } else { "" }
            );
            for failure in report.failures() {
                println!("  FAIL {:?} {}: {}", failure.priority, failure.rule_id, failure.detail);
            }
            Ok(())
        }
        Command::Watch => watch(engine, cancel).await,
        Command::Restart => {
            engine.system_restart(cancel).await.map_err(explain)?;
            println!("restart requested");
            Ok(())
        }
        Command::Helper { action } => helper(engine, action, cancel).await,
    }
}

async fn helper(engine: &Engine, action: HelperAction, cancel: CancelSignal) -> anyhow::Result<()> {
    match action {
        HelperAction::Install => {
            engine
                .install_helper(cancel)
                .await
                .map_err(|e| explain(EngineError::from(e)))?;
            println!("helper {}", engine.helper_status());
        }
        HelperAction::Uninstall => {
            engine
                .uninstall_helper(cancel)
                .await
                .map_err(|e| explain(EngineError::from(e)))?;
            println!("helper {}", engine.helper_status());
        }
        HelperAction::Status => println!("helper {}", engine.helper_status()),
        HelperAction::Health => {
            let (tx, mut rx) = mpsc::channel::<forcequit::ipc::protocol::Progress>(16);
            let printer = tokio::spawn(async move {
                while let Some(progress) = rx.recv().await {
                    eprintln!("[{:>3}%] {}", progress.percent, progress.stage);
                }
            });
            let health = engine.helper_health(Some(tx)).await.map_err(explain);
            let _ = printer.await;
            let health = health?;
            println!(
                "helper {} up {}s, {}/{} connections",
                health.version, health.uptime_secs, health.active_connections, health.max_connections
            );
            for check in &health.checks {
                println!("  {} {}: {}", if check.ok { "ok  " } else { "FAIL" }, check.name, check.detail);
            }
        }
    }
    Ok(())
}

async fn watch(engine: &Arc<Engine>, cancel: CancelSignal) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = engine.spawn_background(shutdown_rx);
    let mut events = engine.subscribe_audit();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "audit stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            () = cancel.cancelled() => break,
        }
    }
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn build_engine(
    config: &Config,
    paths: &RuntimePaths,
    consent: Arc<dyn ConsentPrompt>,
) -> anyhow::Result<Engine> {
    let audit = Arc::new(AuditLog::open(&paths.audit_file)?);
    let verifier = platform_verifier();
    let host: Arc<dyn ProcessHost> = Arc::new(SysinfoHost::new(Arc::clone(&verifier)));

    let self_pid = std::process::id();
    let caller_uid = host.describe(self_pid).and_then(|d| d.owner_uid);
    let self_exe = std::env::current_exe().context("cannot locate own executable")?;

    let tables = PolicyTables::native()
        .with_protected_names(config.policy.extra_protected_names.iter())
        .with_preserved_names(config.policy.preserved_names.iter());
    let classifier = Arc::new(SafetyClassifier::new(tables, self_pid));

    let client_identifier = verifier
        .identify(&self_exe)
        .map(|id| id.identifier)
        .with_context(|| format!("cannot identify {}", self_exe.display()))?;
    let source_binary = match &config.helper.source_binary {
        Some(path) => path.clone(),
        None => self_exe
            .parent()
            .map(|dir| dir.join(HELPER_BINARY))
            .unwrap_or_else(|| PathBuf::from(HELPER_BINARY)),
    };
    let installer = Arc::new(ServiceInstaller::new(ServiceInstallerConfig {
        source_binary,
        install_path: config.helper.install_path.clone(),
        config_path: config.helper.config_path.clone(),
        socket_path: config.ipc.socket_path.clone(),
        client_identifier,
    }));

    let rules = default_rules(RuleInputs {
        self_exe,
        classifier: Arc::clone(&classifier),
        installer: installer.clone(),
        verifier,
        runtime_dir: paths.root.clone(),
        audit: Arc::clone(&audit),
    });
    let validator = Arc::new(SecurityValidator::new(
        rules,
        Duration::from_millis(config.validation.rule_timeout_ms),
        Arc::clone(&audit),
    ));

    let authorizer = Arc::new(Authorizer::new(AuthorizerDeps {
        consent,
        installer,
        validator: Arc::clone(&validator),
        audit: Arc::clone(&audit),
    }));

    let client = Arc::new(HelperClient::new(
        Arc::new(UnixSocketConnector::new(config.ipc.socket_path.clone())),
        ClientSettings {
            request_timeout: Duration::from_secs(config.ipc.request_timeout_secs),
            max_frame_bytes: config.ipc.max_frame_bytes,
        },
    ));

    Ok(Engine::new(EngineDeps {
        host,
        classifier,
        authorizer,
        validator,
        client,
        audit,
        caller_uid,
        settings: EngineSettings {
            termination: config.termination.settings(),
            validation_interval: Duration::from_secs(config.validation.interval_secs),
            state_file: Some(paths.state_file.clone()),
        },
    }))
}

/// Answer consent notices from the terminal with y/N.
async fn run_terminal_prompt(broker: Arc<ConsentBroker>, mut notices: mpsc::Receiver<ConsentNotice>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(notice) = notices.recv().await {
        eprint!("{} [y/N] ", notice.request.summary);
        let approved = match lines.next_line().await {
            Ok(Some(line)) => matches!(line.trim(), "y" | "Y" | "yes"),
            _ => false,
        };
        let resolution = broker.resolve(&notice.id, approved);
        debug!(consent_id = %notice.id, approved, ?resolution, "consent answered from terminal");
    }
}

fn print_outcome(outcome: &TerminationOutcome) {
    println!(
        "{:>7}  {:<17}  {} [{}]: {}",
        outcome.pid,
        outcome.status,
        outcome.name.as_deref().unwrap_or("?"),
        outcome.tier,
        outcome.detail
    );
    if let Some(hint) = &outcome.remediation {
        println!("         hint: {hint}");
    }
}

fn explain(error: EngineError) -> anyhow::Error {
    anyhow::anyhow!("{error}\n  hint: {}", error.remediation())
}
