// Grove daemon: directory registration, local tree publication, protocol engine.

mod config;
mod keys;

use std::sync::Arc;

use grove_core::{build_path, Engine, EngineConfig, LogSink};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("grove-node {} — peer-to-peer Merkle file exchange daemon", VERSION);
    println!();
    println!("USAGE:");
    println!("    grove-node [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Registers with the central directory, publishes the Merkle root");
    println!("    of the local data directory, and serves / fetches content-");
    println!("    addressed trees over authenticated UDP sessions, with NAT");
    println!("    traversal when a direct path fails.");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/grove/config.toml");
    println!("      /etc/grove/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      name = \"my-node\"");
    println!("      udp_port = 7513");
    println!("      data_dir = \"data\"");
    println!("      encrypt = false");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    GROVE_NAME             Our name in the directory");
    println!("    GROVE_UDP_PORT         UDP listen port (default: 7513)");
    println!("    GROVE_DATA_DIR         Published data directory (default: data)");
    println!("    GROVE_KEY_DIR          Key directory (default: keys)");
    println!("    GROVE_DIRECTORY_URL    Directory REST base URL");
    println!("    GROVE_DIRECTORY_UDP    Directory UDP endpoint");
    println!("    GROVE_DIRECTORY_NAME   Directory peer name");
    println!("    GROVE_ENCRYPT          Enable the encryption extension (1/true)");
    println!();
    println!("LOGGING:");
    println!("    RUST_LOG controls verbosity, e.g. RUST_LOG=grove_core=debug");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("grove-node {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("grove-node: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load();
    let identity = keys::load_or_generate(&cfg.key_dir)?;
    info!(
        name = %cfg.name,
        key = %hex::encode(identity.public_key_bytes()),
        "identity ready"
    );

    let engine_cfg = EngineConfig {
        name: cfg.name.clone(),
        bind: std::net::SocketAddr::new(
            std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            cfg.udp_port,
        ),
        directory_url: cfg.directory_url.clone(),
        directory_udp: cfg.directory_udp.clone(),
        directory_name: cfg.directory_name.clone(),
        encrypt: cfg.encrypt,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        // Binding the socket is the only fatal failure.
        let engine = Engine::bind(engine_cfg, identity, Arc::new(LogSink)).await?;

        std::fs::create_dir_all(&cfg.data_dir)?;
        match build_path(engine.store(), &cfg.data_dir) {
            Ok(root) => {
                engine.set_local_root(root);
                info!(root = %hex::encode(root), "local tree published");
            }
            Err(err) => error!(%err, "could not build the local tree"),
        }

        engine.start();

        if let Err(err) = engine.bootstrap().await {
            // Directory errors are retried by the keepalive loop.
            warn!(%err, "directory bootstrap failed");
        }

        shutdown_signal().await;
        info!("shutting down");
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
