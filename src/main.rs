use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};
use tsnode::config::{Config, LoggingConfig};
use tsnode::error::AppError;
use tsnode::node::Node;
use tsnode::shutdown::ShutdownManager;
use tsnode::storage::{open_store, PeerTable};

#[derive(Parser, Debug)]
#[command(name = "tsnode")]
#[command(about = "Timestamping peer network daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "tsnode.toml")]
    config: String,

    /// Log everything at trace level
    #[arg(short, long)]
    verbose: bool,

    /// Write a default config to --config and exit
    #[arg(long)]
    generate_config: bool,

    /// Preferred listen port (overrides the persisted one)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Do not contact the seed peer even if no peers are known
    #[arg(long)]
    no_bootstrap: bool,
}

/// Where log lines go
enum LogTarget {
    /// Daily-rolling file under the configured directory
    File { directory: String, file_name: String },
    /// journald stamps time and host itself
    Journald,
    Terminal,
}

impl LogTarget {
    fn detect(config: &LoggingConfig) -> Self {
        if config.output == "file" {
            let path = Path::new(&config.file_path);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "tsnode.log".to_string());
            return LogTarget::File {
                directory: directory.to_string_lossy().to_string(),
                file_name,
            };
        }
        if std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok() {
            LogTarget::Journald
        } else {
            LogTarget::Terminal
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        let mut config = Config::default();
        config.normalize();
        if let Err(e) = config.save_to_file(&args.config) {
            eprintln!("❌ Failed to generate config: {}", e);
            std::process::exit(1);
        }
        println!("✅ Generated default config at: {}", args.config);
        return;
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if args.no_bootstrap {
        config.network.enable_bootstrap = false;
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);
    tracing::info!(
        "🚀 tsnode {} ({} built {}) on {}",
        env!("CARGO_PKG_VERSION"),
        env!("TSNODE_REVISION"),
        env!("TSNODE_BUILD_DATE"),
        short_hostname()
    );
    tracing::info!("✓ Loaded configuration from {}", args.config);

    let shutdown = match run(&config, args.listen_port).await {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::error!("❌ {}", e);
            std::process::exit(1);
        }
    };
    shutdown.wait_for_shutdown().await;
}

/// Open storage and start the node; returns the manager owning its tasks
async fn run(config: &Config, listen_port: Option<u16>) -> Result<ShutdownManager, AppError> {
    let store = open_store(&config.storage)?;
    tracing::info!(
        "💾 Storage: {} ({})",
        config.storage.backend,
        config.storage.data_dir
    );
    let table = PeerTable::new(store);

    if let Some(port) = listen_port {
        if let Err(e) = table.set_listen_port(port).await {
            tracing::warn!("Failed to persist listen port {}: {}", port, e);
        }
    }

    let mut shutdown = ShutdownManager::new();
    let node = Node::start(&config.network, table, &mut shutdown).await?;
    tracing::info!(
        "✓ Listening on UDP port {} ({} tasks running)",
        node.listen_port,
        shutdown.task_count()
    );
    Ok(shutdown)
}

fn short_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Install the global subscriber. The returned guard flushes file output
/// and must live until exit.
fn setup_logging(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "trace" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = config.format == "json";

    let (layer, guard): (Box<dyn Layer<Registry> + Send + Sync>, Option<WorkerGuard>) =
        match LogTarget::detect(config) {
            LogTarget::File {
                directory,
                file_name,
            } => {
                if let Err(e) = std::fs::create_dir_all(&directory) {
                    eprintln!("❌ Failed to create log directory {}: {}", directory, e);
                }
                let appender = tracing_appender::rolling::daily(directory, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer().with_writer(writer).with_ansi(false);
                let layer = if json {
                    layer.json().boxed()
                } else {
                    layer.with_target(false).compact().boxed()
                };
                (layer, Some(guard))
            }
            _ if json => (fmt::layer().json().boxed(), None),
            LogTarget::Journald => (
                fmt::layer()
                    .with_target(false)
                    .without_time()
                    .compact()
                    .boxed(),
                None,
            ),
            LogTarget::Terminal => (
                fmt::layer()
                    .with_target(false)
                    .with_timer(HostTimer {
                        hostname: short_hostname(),
                    })
                    .compact()
                    .boxed(),
                None,
            ),
        };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .init();
    guard
}

/// UTC timestamp with millisecond precision, tagged with the host
struct HostTimer {
    hostname: String,
}

impl fmt::time::FormatTime for HostTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
