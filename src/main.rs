use clap::{ArgAction, Parser};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard::config::Config;
use switchyard::proxy::ProxyServer;
use switchyard::role::{ProcessRole, READY_LINE_PREFIX};
use switchyard::supervisor::WorkerSupervisor;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "switchyard",
    version,
    disable_version_flag = true,
    about = "A clustered reverse proxy that routes requests by path slug"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(
        short = 'c',
        long = "config",
        value_name = "path",
        default_value = "config.json"
    )]
    config: PathBuf,

    /// Print the package version and exit
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() {
    // stdout carries the worker control line; all logging goes to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchyard=info".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();
    let role = ProcessRole::detect();

    // Fail fast: the config must be fully loaded and valid before any
    // socket is bound or worker is forked
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let result = match role {
        ProcessRole::Supervisor => run_supervisor(config, cli.config).await,
        ProcessRole::Worker => run_worker(config).await,
    };

    if let Err(e) = result {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

async fn run_supervisor(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server_port,
        services = config.services.len(),
        cluster_size = config.cluster_size,
        restart_workers = config.restart_workers,
        force_shutdown_on_worker_exit = config.force_shutdown_on_worker_exit,
        "Starting supervisor"
    );

    WorkerSupervisor::new(config, config_path).run().await
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // SIGTERM from the supervisor (or Ctrl+C when run standalone) stops the
    // accept loop; in-flight relays die with the process
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let server = ProxyServer::bind(bind_addr, Arc::new(config), shutdown_rx)?;
    let addr = server.local_addr()?;

    // The single control line the supervisor reads from our stdout; flushed
    // explicitly because a piped stdout is block-buffered
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}{}", READY_LINE_PREFIX, addr.port())?;
    stdout.flush()?;

    server.run().await
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
