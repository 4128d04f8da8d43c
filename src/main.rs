use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tunnelgate::admin::{AdminServer, PKG_NAME, VERSION};
use tunnelgate::config::Config;
use tunnelgate::registry::Registry;
use tunnelgate::server::TunnelServer;
use tunnelgate::tunnel::TunnelAllocator;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
#[command(name = "tunnelgate", version, about = "Expose local services through public subdomains")]
struct Cli {
    /// Public server port
    #[arg(long, env = "LT_SERVER_PORT")]
    port: Option<u16>,

    /// Public server bind host
    #[arg(long, env = "LT_SERVER_HOST")]
    host: Option<String>,

    /// Admin API port for metrics (disabled unless set)
    #[arg(long)]
    admin_port: Option<u16>,

    /// Config file path (TOML, auto-loads ./tunnelgate.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write PID to file
    #[arg(long = "pid")]
    pid_file: Option<PathBuf>,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    let config = resolve_config(&cli)?;

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(Registry::new(config.server.max_conn_count));
    let allocator = Arc::new(TunnelAllocator::new(
        Arc::clone(&registry),
        config.server.host.clone(),
        config.server.grace_period(),
        shutdown_rx.clone(),
    ));

    // Public listener bind failure is fatal
    let server = TunnelServer::bind(
        (config.server.host.as_str(), config.server.port),
        Arc::clone(&registry),
        Arc::clone(&allocator),
        shutdown_rx.clone(),
    )
    .await
    .map_err(|e| {
        error!(host = %config.server.host, port = config.server.port, error = %e, "Failed to start server");
        e
    })?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Tunnel server error");
        }
    });

    // Admin server is optional and loopback-only
    let admin_handle = if config.server.admin_enabled() {
        let admin = AdminServer::bind(
            ("127.0.0.1", config.server.admin_port),
            Arc::clone(&registry),
            shutdown_rx.clone(),
        )
        .await
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Failed to start admin server");
            e
        })?;
        Some(tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Load the config file, then layer CLI/env overrides on top
fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => {
            let default_path = Path::new("tunnelgate.toml");
            if default_path.exists() {
                let config = Config::load(default_path)?;
                info!(path = %default_path.display(), "Configuration loaded");
                config
            } else {
                Config::default()
            }
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(admin_port) = cli.admin_port {
        config.server.admin_port = admin_port;
    }
    if let Some(ref pid) = cli.pid_file {
        config.server.pid_file = Some(pid.display().to_string());
    }

    config.validate()?;
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tunnel server");
    info!(
        host = %config.server.host,
        port = config.server.port,
        admin_port = if config.server.admin_enabled() { Some(config.server.admin_port) } else { None },
        "Server configuration"
    );
    info!(
        max_conn_count = config.server.max_conn_count,
        grace_period_ms = config.server.grace_period_ms,
        "Tunnel settings"
    );
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Write PID
        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}
