mod auth;
mod config;
mod error;
mod models;
mod pool;
mod server;
mod stream;
mod tokens;
mod translate;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auth::{CredentialStore, HttpClient};
use config::Config;
use pool::{CooldownRegistry, CredentialSelector, QuotaMonitor};
use server::ServerState;
use tokens::UsageLedger;
use translate::SignatureCache;
use upstream::UpstreamClient;

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args: Vec<String> = std::env::args().collect();
    let mut port: Option<u16> = None;
    let mut host: Option<String> = None;
    let mut debug = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                match args.get(i).and_then(|v| v.parse::<u16>().ok()) {
                    Some(p) if p > 0 => port = Some(p),
                    _ => {
                        eprintln!("Invalid or missing value for --port");
                        std::process::exit(1);
                    }
                }
            }
            "--host" => {
                i += 1;
                match args.get(i) {
                    Some(h) => host = Some(h.clone()),
                    None => {
                        eprintln!("Missing value for --host");
                        std::process::exit(1);
                    }
                }
            }
            "--debug" | "-d" => debug = true,
            "-h" | "--help" => {
                print_help();
                return;
            }
            "-V" | "--version" => {
                println!("agrelay {}", env!("CARGO_PKG_VERSION"));
                return;
            }
            arg => {
                eprintln!("Unknown option: {arg}");
                eprintln!("Run 'agrelay --help' for usage information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    init_logging(debug);

    let config = Config::from_env().with_overrides(port, host);
    config::init_config(config.clone());

    let store = match CredentialStore::load(&config.pool.credentials_file) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, path = %config.pool.credentials_file.display(), "Failed to load credentials");
            std::process::exit(1);
        }
    };
    if store.is_empty().await {
        warn!(
            path = %config.pool.credentials_file.display(),
            "No enabled credentials loaded; requests will fail until some are added"
        );
    }

    let cooldowns = match CooldownRegistry::load(&config.pool.cooldowns_file) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, path = %config.pool.cooldowns_file.display(), "Failed to load cooldowns");
            std::process::exit(1);
        }
    };

    let http = Arc::new(HttpClient::new());
    let upstream = Arc::new(UpstreamClient::new(&config));
    let ledger = Arc::new(UsageLedger::new());
    let signatures = Arc::new(SignatureCache::new());

    // Dependency order: store -> cooldowns -> monitor -> selector; the
    // selector learns about the monitor through the used-callback.
    let monitor = QuotaMonitor::new(store.clone(), http.clone(), upstream.clone(), &config);
    let selector = Arc::new(CredentialSelector::new(
        store.clone(),
        cooldowns.clone(),
        ledger.clone(),
        http.clone(),
        &config,
    ));
    {
        let monitor = monitor.clone();
        selector.set_on_used(move |project_id| monitor.mark_used(project_id));
    }

    let monitor_task = monitor.clone().spawn();

    let state = Arc::new(ServerState {
        config: config.clone(),
        cooldowns: cooldowns.clone(),
        monitor,
        selector,
        signatures,
        upstream,
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid listen address");

    if let Err(e) = run_server(addr, state).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }

    monitor_task.abort();
    cooldowns.shutdown();
    info!("Shutdown complete");
}

async fn run_server(addr: SocketAddr, state: Arc<ServerState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "agrelay proxy listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping server");
                break;
            }
            result = listener.accept() => {
                let (stream, remote_addr) = result?;
                let state = state.clone();

                tokio::spawn(async move {
                    if let Err(e) = server::handle_connection(stream, remote_addr, state).await {
                        warn!(error = %e, remote = %remote_addr, "Connection error");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agrelay=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agrelay=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn print_help() {
    println!(
        r#"agrelay - Anthropic Messages API proxy over the Antigravity upstream

USAGE:  agrelay [OPTIONS]

OPTIONS:
  -p, --port <PORT>   Listen port (default: 8045, env PORT)
      --host <HOST>   Bind address (default: 127.0.0.1, env HOST)
  -d, --debug         Enable debug logging
  -h, --help          Show this help message
  -V, --version       Show version information

Configuration is environment-driven; see the README for the full list
(CREDENTIALS_FILE, COOLDOWNS_FILE, CREDENTIAL_MAX_USAGE_PER_HOUR, TIMEOUT,
API_KEY, PANEL_USER, PANEL_PASSWORD, ...)."#
    );
}
