use std::path::PathBuf;

use fluux_server::{ServerConfig, XmppServer};

const APP_DIR: &str = "com.processone.fluux";

fn main() {
    // Parse CLI flags early, before tracing subscriber init
    let args: Vec<String> = std::env::args().collect();

    // Parse verbose level: --verbose / -v (default, no XMPP packets) or --verbose=xmpp (with packets)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let verbose = verbose_level.is_some();

    // Parse --log-file=<path> option
    let log_file_path = args.iter().find_map(|arg| {
        arg.strip_prefix("--log-file=").map(|s| s.to_string())
    });

    let config_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--config=").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("fluux-server.toml"));

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        eprintln!("Fluux Server v{}", env!("CARGO_PKG_VERSION"));
        eprintln!();
        eprintln!("Usage: fluux-server [OPTIONS]");
        eprintln!();
        eprintln!("Options:");
        eprintln!("      --config=PATH     Configuration file (default: {})", config_path.display());
        eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
        eprintln!("      --verbose=xmpp    Enable verbose logging including XMPP stanza content");
        eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
        eprintln!("  -h, --help            Show this help message");
        eprintln!();
        eprintln!("Logs are always written to a daily-rotating file in:");
        eprintln!("  macOS:   ~/Library/Logs/com.processone.fluux/");
        eprintln!("  Linux:   ~/.local/share/com.processone.fluux/logs/");
        eprintln!("  Windows: %APPDATA%\\com.processone.fluux\\logs\\");
        eprintln!();
        eprintln!("Environment variables:");
        eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
        std::process::exit(0);
    }

    // Determine the log directory: --log-file=<path> overrides the default platform path
    let log_dir = if let Some(ref path) = log_file_path {
        PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        let dir = base.join(APP_DIR).join("logs");

        #[cfg(target_os = "macos")]
        let dir = dirs::home_dir()
            .map(|h| h.join("Library").join("Logs").join(APP_DIR))
            .unwrap_or(dir);

        dir
    };

    // Initialize tracing subscriber:
    // - Always write to a log file in the platform log directory
    // - Optionally add stderr output when --verbose is passed
    {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
        }

        let file_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("fluux_server=info,info")
        };

        // File layer: daily-rotating log file, non-blocking writes
        let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-server.log");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        // Stderr layer: only when --verbose or --log-file is passed
        let stderr_layer = if verbose || log_file_path.is_some() || std::env::var("RUST_LOG").is_ok() {
            let effective_level = verbose_level.or(if log_file_path.is_some() { Some("default") } else { None });

            let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
                EnvFilter::from_default_env()
            } else if effective_level == Some("xmpp") {
                EnvFilter::new(
                    "fluux_server=info,fluux_server::xmpp_server::connection=debug,\
                     fluux_server::xmpp_server::negotiation=debug,info",
                )
            } else {
                EnvFilter::new("fluux_server=info,info")
            };

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .init();

        // The writer thread must live until process exit.
        std::mem::forget(_guard);
    }

    eprintln!("Log file: {}", log_dir.join("fluux-server.log").display());

    let config = match ServerConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        domain = %config.server.domain,
        "Fluux server starting"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build the async runtime");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        let mut server = XmppServer::new(config)?;
        server.start().await?;
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c, shutting down");
        }
        server.stop().await;
        Ok::<(), fluux_server::XmppError>(())
    });

    if let Err(e) = result {
        tracing::error!(error = %e, "Server failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Fluux server stopped");
}
