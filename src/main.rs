use clap::Parser;
use icarus::agents::EventDrivenAgent;
use icarus::config::{AppConfig, LoggingConfig};
use icarus::coordination::{
    install_signal_handlers, AgentRuntime, EmergencyReason, GracefulShutdown, HaltSwitch,
    ShutdownSignal,
};
use icarus::fork::{ForkManager, TsdbCliProvisioner};
use icarus::persistence::{AuditRecorder, MemoryStore, PostgresStore, StateStore};
use icarus::supervisor::AlertManager;
use icarus::EventBus;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Agent coordination runtime with ephemeral database forks
#[derive(Debug, Parser)]
#[command(name = "icarus", version, about)]
struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(long, env = "ICARUS_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Environment file to layer over the defaults
    #[arg(long, env = "ICARUS_ENV")]
    env: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir, cli.env.as_deref())?;
    let _guard = init_logging(&config.logging);

    if let Err(errors) = config.validate() {
        for violation in &errors {
            error!("config: {}", violation);
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }

    if cli.check_config {
        info!("configuration OK");
        return Ok(());
    }

    run(config).await
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let bus = EventBus::new(config.bus.clone());

    let store: Arc<dyn StateStore> = match config.database {
        Some(ref database) => Arc::new(PostgresStore::connect(database).await?),
        None => {
            warn!("no [database] configured, audit trail and fork registry are in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let alerts = Arc::new(AlertManager::new(config.alerts.clone()).with_store(store.clone()));
    let halt = Arc::new(
        HaltSwitch::new()
            .with_bus(bus.clone())
            .with_store(store.clone()),
    );
    let provisioner = Arc::new(TsdbCliProvisioner::new(&config.provisioner));

    let forks = ForkManager::builder(config.forks.clone(), bus.clone(), provisioner)
        .store(store.clone())
        .alerts(alerts.clone())
        .halt_switch(halt.clone())
        .build();

    match forks.recover().await {
        Ok(0) => {}
        Ok(n) => info!("recovered {} live forks from the state store", n),
        Err(e) => warn!("fork recovery failed, starting with an empty registry: {}", e),
    }

    let runtime = AgentRuntime::new(bus.clone(), halt.clone(), config.agents.clone());
    runtime
        .spawn(Arc::new(EventDrivenAgent::new(AuditRecorder::new(store))), 0)
        .await;
    runtime.spawn(Arc::new(forks), 1).await;

    info!(
        "icarus running: max_forks={} default_ttl={}s",
        config.forks.max_concurrent_forks, config.forks.default_ttl_secs
    );

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone());
    let signal = shutdown.wait().await;
    info!("shutdown requested ({})", signal);

    if signal == ShutdownSignal::Urgent {
        alerts
            .critical("runtime", "Urgent Shutdown", "SIGQUIT received, refusing new forks")
            .await;
        halt.trigger(EmergencyReason::Signal, Some("SIGQUIT".to_string()))
            .await;
    }

    runtime.shutdown(&signal.to_string()).await;
    info!("icarus stopped");
    Ok(())
}

/// Console plus optional daily-rolling file output. The returned guard
/// must outlive the runtime or buffered file lines are lost.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.level)));

    // rolling::daily panics if it can't create the first file, so preflight
    let mut guard = None;
    let file_layer = config.dir.as_deref().and_then(|dir| {
        let probe = std::path::Path::new(dir).join(".icarus_write_test");
        let writable = std::fs::create_dir_all(dir).and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&probe)
                .map(|_| ())
        });
        match writable {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                let appender = tracing_appender::rolling::daily(dir, "icarus.log");
                let (writer, g) = tracing_appender::non_blocking(appender);
                guard = Some(g);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir, e
                );
                None
            }
        }
    });

    let (json_layer, plain_layer) = if config.json {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .init();

    guard
}
