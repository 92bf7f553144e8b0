// LCP daemon: LAN peer discovery, chat messaging, file transfer.

mod config;
mod stores;

use std::sync::Arc;
use std::time::Duration;

use lcp_core::{Engine, EngineConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!("lcp-node {} — Local Chat Protocol daemon", VERSION);
    println!();
    println!("USAGE:");
    println!("    lcp-node [OPTIONS] [USER_ID]");
    println!();
    println!("ARGS:");
    println!("    USER_ID          Identity announced on the LAN (max 20 bytes)");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print this help message and exit");
    println!("    -V, --version    Print version and exit");
    println!();
    println!("DESCRIPTION:");
    println!("    Starts an LCP node: discovers peers on the local network via");
    println!("    UDP broadcast, exchanges acknowledged text messages, and");
    println!("    receives files over TCP into <data_dir>/downloads.");
    println!();
    println!("    Control     UDP 9990");
    println!("    Files       TCP 9990");
    println!();
    println!("    Stop with Ctrl+C or SIGTERM.");
    println!();
    println!("CONFIGURATION:");
    println!("    Config file (optional, first found wins):");
    println!("      ~/.config/lcp/config.toml");
    println!("      /etc/lcp/config.toml");
    println!();
    println!("    Example config.toml:");
    println!("      user_id = \"alice\"");
    println!("      broadcast_interval = 1.0");
    println!("      port = 9990");
    println!("      data_dir = \"lcp-data\"");
    println!();
    println!("ENVIRONMENT VARIABLES (override config file):");
    println!("    LCP_USER_ID              Identity announced on the LAN");
    println!("    LCP_BROADCAST_INTERVAL   Seconds between discovery probes");
    println!("    LCP_PORT                 Shared UDP/TCP port (default: 9990)");
    println!("    LCP_DATA_DIR             State directory (default: lcp-data)");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut user_arg = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lcp-node {}", VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if other.starts_with('-') => {
                eprintln!("lcp-node: unknown option '{}'\n", other);
                print_help();
                std::process::exit(1);
            }
            other => user_arg = Some(other.to_string()),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let Some(user_id) = user_arg.or(cfg.user_id.clone()) else {
        eprintln!("lcp-node: no user id (pass USER_ID, set LCP_USER_ID, or configure user_id)\n");
        print_help();
        std::process::exit(1);
    };

    let peer_store = Arc::new(stores::JsonPeerStore::new(cfg.data_dir.join("peers.json")));
    let history = Arc::new(stores::JsonHistoryStore::new(
        cfg.data_dir.join("history.json"),
    ));
    let engine_cfg = EngineConfig {
        user_id,
        broadcast_interval: Duration::from_secs_f64(cfg.broadcast_interval),
        port: cfg.port,
        downloads_dir: cfg.data_dir.join("downloads"),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Engine::new(engine_cfg, peer_store, history).await?;
        engine.start();
        wait_for_stop().await?;
        engine.shutdown();
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}

/// Block until the process is asked to stop. On Unix both SIGINT and
/// SIGTERM count; elsewhere only Ctrl+C is available. Workers exit on
/// the shutdown broadcast and sockets close with the process.
#[cfg(unix)]
async fn wait_for_stop() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
