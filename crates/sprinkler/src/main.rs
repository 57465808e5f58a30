//! Sprinkler hub entry point: parses CLI flags, loads configuration, wires
//! the engine to its HTTP surface, and runs until a shutdown signal.

mod config;
mod control;
mod discovery;
mod engine;
mod feed;
mod http;
mod index;
mod interval;
mod program;
mod schedule;
mod season;
mod state;
mod time_util;
mod zone;

use anyhow::Result;
use discovery::{NullDepot, StaticDiscovery};
use engine::{Command, Engine};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use time_util::SimClock;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

struct Cli {
    debug: bool,
    sim_speed: i64,
    sim_delta: i64,
    config_path: String,
    backup_path: String,
    use_local_storage: bool,
    unrecognized: Vec<String>,
}

impl Cli {
    fn parse(args: impl Iterator<Item = String>) -> Self {
        let mut cli = Self {
            debug: false,
            sim_speed: 1,
            sim_delta: 0,
            config_path: config::DEFAULT_CONFIG_PATH.to_string(),
            backup_path: state::DEFAULT_STATE_PATH.to_string(),
            use_local_storage: true,
            unrecognized: Vec::new(),
        };
        for arg in args {
            if let Some(v) = arg.strip_prefix("-sim-speed=") {
                cli.sim_speed = v.parse().unwrap_or(1);
            } else if let Some(v) = arg.strip_prefix("-sim-delta=") {
                cli.sim_delta = parse_delta(v).unwrap_or(0);
            } else if let Some(v) = arg.strip_prefix("-config=") {
                cli.config_path = v.to_string();
            } else if let Some(v) = arg.strip_prefix("-backup=") {
                cli.backup_path = v.to_string();
            } else if arg == "-debug" {
                cli.debug = true;
            } else if arg == "-use-local-storage" {
                cli.use_local_storage = true;
            } else if arg == "-no-local-storage" {
                cli.use_local_storage = false;
            } else {
                cli.unrecognized.push(arg);
            }
        }
        cli
    }
}

/// Parse `N[dhm]` (days/hours/minutes, default seconds with no suffix) into
/// a signed second count.
fn parse_delta(s: &str) -> Option<i64> {
    let (digits, unit) = match s.chars().last() {
        Some(c @ ('d' | 'h' | 'm')) => (&s[..s.len() - 1], c),
        _ => (s, 's'),
    };
    let n: i64 = digits.parse().ok()?;
    Some(match unit {
        'd' => n * 86_400,
        'h' => n * 3_600,
        'm' => n * 60,
        _ => n,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse(env::args().skip(1));

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cli.debug { "debug".into() } else { "info".into() }
        }))
        .init();

    for flag in &cli.unrecognized {
        warn!(flag = %flag, "ignoring unrecognized command-line flag");
    }

    let host = hostname();
    info!(%host, config = %cli.config_path, backup = %cli.backup_path, "sprinkler hub starting");

    if !cli.use_local_storage {
        warn!("-no-local-storage requested, but no remote depot client is wired in this build; falling back to local-file persistence");
    }

    let discovery: Arc<dyn discovery::ServiceDiscovery> = Arc::new(StaticDiscovery::new());
    let depot: Arc<dyn discovery::DepotClient> = Arc::new(NullDepot::new());
    let sim = SimClock::new(cli.sim_speed, cli.sim_delta);

    let engine = Engine::new(
        host,
        cli.config_path,
        cli.backup_path,
        discovery,
        depot,
        sim,
    )?;

    let (tx, rx) = mpsc::channel::<Command>(COMMAND_CHANNEL_CAPACITY);

    let mut engine_handle = tokio::spawn(engine.run(rx));

    let port: u16 = env::var("SPRINKLER_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "http surface listening");

    let app = http::router(http::AppState { commands: tx.clone() });
    let mut http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    loop {
        tokio::select! {
            result = &mut engine_handle => {
                error!("CRITICAL: engine tick task exited unexpectedly: {result:?}");
                exit_reason = "engine task died";
                break;
            }
            result = &mut http_handle => {
                error!("http server task exited unexpectedly: {result:?}");
                exit_reason = "http task died";
                break;
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    warn!(signal = exit_reason, "shutting down — stopping all zones");
    let _ = tx.send(Command::ZoneOff).await;
    // give the tick task one last chance to process the stop and persist
    // state before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("shutdown complete");
    Ok(())
}

fn hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_string()))
        .unwrap_or_else(|| "sprinkler".to_string())
}
