use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use electrumx_sync::config::{Config, LoggingConfig};
use electrumx_sync::error::{AppError, FailureClass};
use electrumx_sync::headers::sync::SyncState;
use electrumx_sync::network_type::NetworkType;
use electrumx_sync::node::Node;
use electrumx_sync::reconnect::Backoff;
use electrumx_sync::shutdown::ShutdownManager;

#[derive(Parser, Debug)]
#[command(name = "exsyncd")]
#[command(about = "ElectrumX header-sync daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// mainnet, testnet or regtest (overrides the config file)
    #[arg(long)]
    network: Option<NetworkType>,

    /// Server address, e.g. ssl://host:50002 (overrides the config file)
    #[arg(long)]
    server: Option<String>,

    /// Use TLS for addresses without a scheme
    #[arg(long)]
    tls: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let network = args.network.unwrap_or_else(|| {
        Config::load_from_file(&args.config)
            .map(|cfg| cfg.network())
            .unwrap_or(NetworkType::Mainnet)
    });

    if args.generate_config {
        let config = Config::default_for(network);
        match config.save_to_file(&args.config) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", args.config.display());
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match load_config(&args, network) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = match setup_logging(&config.logging, args.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");
    info!("🚀 exsyncd v{} ({}, built {})", version, git_hash, build_date);
    info!("📡 Network: {}", config.network());
    info!("  └─ Server: {}", config.server.address);
    info!("  └─ Data Dir: {}", config.data_dir().display());
    info!("  └─ Start point: {}", config.start_point());

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();
    shutdown_manager.register_task(shutdown_manager.spawn_signal_listener());

    let result = run_daemon(&config, &shutdown_token, &mut shutdown_manager).await;
    shutdown_manager.shutdown().await;

    if let Err(e) = result {
        error!("❌ {}", e);
        std::process::exit(1);
    }
    info!("👋 Shutdown complete");
}

fn load_config(args: &Args, network: NetworkType) -> Result<Config, AppError> {
    let mut config = Config::load_or_create(&args.config, network)?;
    if let Some(network) = args.network {
        config.node.network = network;
    }
    if let Some(server) = &args.server {
        config.server.address = server.clone();
    }
    if args.tls {
        config.server.tls = true;
    }
    config.validate()?;
    Ok(config)
}

/// Keep a node connected until shutdown or a failure that retrying cannot fix.
async fn run_daemon(
    config: &Config,
    token: &CancellationToken,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AppError> {
    let node = Arc::new(Node::new(config, token)?);

    shutdown_manager.register_task(tokio::spawn(log_tip_events(
        Arc::clone(&node),
        config.wallet.watch_scripthashes.clone(),
        token.clone(),
    )));
    shutdown_manager.register_task(tokio::spawn(log_scripthash_events(
        Arc::clone(&node),
        token.clone(),
    )));
    if config.wallet.status_interval_secs > 0 {
        shutdown_manager.register_task(tokio::spawn(report_status(
            Arc::clone(&node),
            Duration::from_secs(config.wallet.status_interval_secs),
            token.clone(),
        )));
    }

    let mut backoff = Backoff::new(config.reconnect_policy());
    let result = loop {
        if token.is_cancelled() {
            break Ok(());
        }

        let outcome = match node.start().await {
            Ok(()) => {
                let outcome = node.run().await;
                if node
                    .sync_state()
                    .is_some_and(|state| state != SyncState::BulkSync)
                {
                    backoff.reset();
                }
                outcome
            }
            Err(e) => Err(e),
        };

        let e = match outcome {
            Ok(()) => break Ok(()),
            Err(_) if token.is_cancelled() => break Ok(()),
            Err(e) => e,
        };

        match e.class() {
            FailureClass::Connection => {
                let Some(delay) = backoff.next_delay() else {
                    break Err(AppError::RetriesExhausted(backoff.attempts()));
                };
                warn!(
                    "🔌 Connection lost ({}); reconnecting in {:.1}s (attempt {})",
                    e,
                    delay.as_secs_f64(),
                    backoff.attempts()
                );
                tokio::select! {
                    _ = token.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            FailureClass::Protocol => {
                error!("🚫 Server rejected: {}", e);
                break Err(e.into());
            }
            FailureClass::Chain => {
                error!("🛑 Header chain needs attention: {}", e);
                break Err(e.into());
            }
        }
    };

    node.stop().await;
    result
}

/// Log tip changes; subscribes the configured scripthashes on the first tip
/// after bulk sync. Reconnects re-subscribe them inside the node.
async fn log_tip_events(node: Arc<Node>, watch: Vec<String>, token: CancellationToken) {
    let Some(mut tips) = node.on_tip_changed() else {
        return;
    };
    let mut subscribed = watch.is_empty();
    loop {
        let height = tokio::select! {
            _ = token.cancelled() => break,
            next = tips.recv() => match next {
                Some(height) => height,
                None => break,
            },
        };
        info!("⛓️  Tip changed: {}", height);
        if subscribed {
            continue;
        }
        subscribed = true;
        for scripthash in &watch {
            match node.subscribe_scripthash(scripthash).await {
                Ok(status) => info!(
                    "👀 Watching {} (status {})",
                    scripthash,
                    status.as_deref().unwrap_or("none")
                ),
                Err(e) => {
                    warn!("⚠️ Failed to subscribe {}: {}", scripthash, e);
                    subscribed = false;
                }
            }
        }
    }
    debug!("Tip event stream closed");
}

async fn log_scripthash_events(node: Arc<Node>, token: CancellationToken) {
    let Some(mut statuses) = node.on_scripthash_status() else {
        return;
    };
    loop {
        let update = tokio::select! {
            _ = token.cancelled() => break,
            next = statuses.recv() => match next {
                Some(update) => update,
                None => break,
            },
        };
        info!(
            "💰 Scripthash {} status {}",
            update.scripthash,
            update.status.as_deref().unwrap_or("none")
        );
    }
}

async fn report_status(node: Arc<Node>, every: Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        let status = node.status();
        let state = status
            .state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "idle".to_string());
        let recovery = if status.recovery.active {
            format!("recovering from {}", status.recovery.recovery_tip)
        } else {
            "none".to_string()
        };
        info!(
            "📊 {} | peer {} | tip {} | synced {} | recovery {} | cost {:.1}",
            state,
            status.peer.as_deref().unwrap_or("-"),
            status
                .tip
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status.synced,
            recovery,
            status.session_cost.unwrap_or(0.0)
        );
    }
}

fn setup_logging(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>, AppError> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // journald adds its own timestamp and hostname
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let (writer, guard, ansi) = if config.output == "file" {
        let path = PathBuf::from(&config.file_path);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "exsyncd.log".to_string());
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix));
        (BoxMakeWriter::new(non_blocking), Some(guard), false)
    } else {
        (BoxMakeWriter::new(std::io::stdout), None, true)
    };

    let result = match config.format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_thread_ids(false)
            .try_init(),
        _ if is_systemd && guard.is_none() => fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .without_time()
            .compact()
            .try_init(),
        _ => fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_timer(CustomTimer {
                hostname: short_hostname,
            })
            .compact()
            .try_init(),
    };
    result.map_err(|e| AppError::Logging(e.to_string()))?;
    Ok(guard)
}

// UTC time plus short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();

        // "2025-12-10 18:09:43.150 [server1]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
