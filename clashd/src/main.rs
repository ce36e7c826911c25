use anyhow::Context;
use clap::{Parser, Subcommand};
use clashd_core::{AppConfig, ConfigLoader, ServiceError, ServiceStatus, Supervisor};
use clashd_nft::{Kernel, RoutingMode, SystemKernel};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// How often the daemon checks that the core is still alive
const WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "clashd")]
#[command(about = "Supervises the mihomo proxy core and its transparent-proxy routing")]
struct Cli {
    /// Application config file
    #[arg(long, short = 'c', env = "CLASHD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay in the foreground: restore the previous state and keep the core alive
    Run,
    /// Start the core and install its routing
    Start,
    /// Stop the core and remove its routing
    Stop {
        /// Do not clear the auto-start flag
        #[arg(long)]
        keep_auto_start: bool,
    },
    Restart,
    /// Show whether the core is running and which routing tables are present
    Status,
    /// Print the tail of the core log
    Logs {
        #[arg(long, short = 'n', default_value = "100")]
        lines: usize,
    },
    ClearLogs,
    /// Print the effective application config
    Config,
    /// Replace the active core config with the contents of FILE
    WriteCoreConfig { file: PathBuf },
    /// Make PATH the active core config
    SwitchConfig { path: PathBuf },
    /// Change the interception mode; a running core is restarted when auto_restart is set
    SetRouting {
        #[arg(long)]
        tcp: RoutingMode,
        #[arg(long)]
        udp: RoutingMode,
        #[arg(long)]
        tun_device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ConfigLoader::default_config_path);
    let config = ConfigLoader::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config {}", config_path.display());

    let kernel: Arc<dyn Kernel> = Arc::new(SystemKernel::new());
    let supervisor = Arc::new(Supervisor::new(config_path, config, kernel));

    match cli.command {
        Command::Run => run_daemon(supervisor).await?,
        Command::Start => supervisor.start().await.context("Failed to start mihomo")?,
        Command::Stop { keep_auto_start } => match supervisor.stop(!keep_auto_start).await {
            Err(ServiceError::NotRunning) => println!("mihomo is not running"),
            other => other.context("Failed to stop mihomo")?,
        },
        Command::Restart => supervisor
            .restart()
            .await
            .context("Failed to restart mihomo")?,
        Command::Status => print_status(&supervisor)?,
        Command::Logs { lines } => {
            for line in supervisor.logs(lines).context("Failed to read core log")? {
                println!("{}", line);
            }
        }
        Command::ClearLogs => supervisor.clear_logs().context("Failed to clear core log")?,
        Command::Config => {
            let text = toml::to_string_pretty(&supervisor.app_config())
                .context("Failed to render config")?;
            print!("{}", text);
        }
        Command::WriteCoreConfig { file } => {
            let contents = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let restarted = supervisor
                .write_core_config(&contents)
                .await
                .context("Failed to write core config")?;
            report_restart(restarted);
        }
        Command::SwitchConfig { path } => {
            let restarted = supervisor
                .switch_core_config(path)
                .await
                .context("Failed to switch core config")?;
            report_restart(restarted);
        }
        Command::SetRouting {
            tcp,
            udp,
            tun_device,
        } => {
            let mut config = supervisor.app_config();
            config.mihomo.routing.tcp = tcp;
            config.mihomo.routing.udp = udp;
            if let Some(device) = tun_device {
                config.mihomo.routing.tun_device = device;
            }
            supervisor
                .update_app_config(config)
                .await
                .context("Failed to update routing")?;
        }
    }

    Ok(())
}

fn report_restart(restarted: bool) {
    if restarted {
        println!("mihomo restarted");
    }
}

/// Stderr always, plus the configured log file when there is one
fn init_logging(config: &AppConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) if verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new(&config.logging.level),
    };

    let writer = match config.logging.file.as_deref().filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => {
            let file = open_append(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(())
}

fn open_append(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn print_status(supervisor: &Supervisor) -> anyhow::Result<()> {
    let status = supervisor.status();
    let config = supervisor.app_config();
    let routing = &config.mihomo.routing;

    println!("mihomo:  {}", status);
    println!(
        "routing: tcp={} udp={} tun_device={}",
        routing.tcp,
        routing.udp,
        routing.tun_device()
    );
    let installed = supervisor
        .installed_routing()
        .context("Failed to inspect routing tables")?;
    println!("tables:  {}", installed);
    if status == ServiceStatus::Running && !config.mihomo.api_url.is_empty() {
        println!("api:     {}", config.mihomo.api_url);
    }
    Ok(())
}

async fn run_daemon(supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    tracing::info!("clashd daemon starting");

    if let Err(e) = supervisor.restore_state().await {
        tracing::error!("Failed to restore mihomo: {}", e);
    }

    let watchdog = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.watch(WATCH_INTERVAL).await })
    };

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to wait for SIGINT")?,
        _ = terminate.recv() => {}
    }
    tracing::info!("Shutdown requested");

    supervisor.shutdown();
    if let Err(e) = watchdog.await {
        tracing::warn!("Watchdog task ended abnormally: {}", e);
    }

    if supervisor.status() == ServiceStatus::Running {
        // keep auto_start so the core comes back with the daemon
        supervisor
            .stop(false)
            .await
            .context("Failed to stop mihomo on shutdown")?;
    }
    tracing::info!("clashd daemon stopped");
    Ok(())
}
