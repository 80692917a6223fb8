//! Process entry point for a storage plug-in binary.
//!
//! [`run`] drives the whole startup contract: log-level resolution, endpoint
//! resolution (usage text and a non-zero exit when it is missing), socket
//! binding with permission and ownership adjustment, signal trapping, and
//! serving until shutdown. The process exits 0 after a graceful stop and 1
//! on any fatal startup error.

use std::process::exit;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::endpoint::{self, Endpoint, EndpointError};
use crate::plugin::StoragePlugin;

/// Launch a CSI storage plug-in and serve until terminated.
///
/// Never returns; the process exits.
pub async fn run(
    app_name: &str,
    app_description: &str,
    app_usage: &str,
    plugin: StoragePlugin,
) -> ! {
    let plugin = Arc::new(plugin);
    let options = plugin.options();

    // Debug mode forces the debug level; request/response logging is
    // switched on during interceptor assembly.
    let level = if options.bool(config::DEBUG) {
        "debug".to_owned()
    } else {
        resolve_log_level(&options.getenv(config::LOG_LEVEL))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .try_init();

    let endpoint_addr = match Endpoint::from_options(&options) {
        Ok(endpoint) => endpoint,
        Err(EndpointError::Missing) => {
            print_usage(app_name, app_description, app_usage);
            exit(1);
        }
        Err(e) => {
            error!(error = %e, "invalid endpoint");
            exit(1);
        }
    };

    let listener = match endpoint_addr.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to listen");
            exit(1);
        }
    };

    if let Some(path) = listener.unix_path().map(std::path::Path::to_owned) {
        if let Err(e) = endpoint::apply_endpoint_perms(&options, &path) {
            error!(error = %e, "failed to chmod endpoint");
            exit(1);
        }
        if let Err(e) = endpoint::apply_endpoint_owner(&options, &path) {
            error!(error = %e, "failed to chown endpoint");
            exit(1);
        }
    }

    trap_signals(Arc::clone(&plugin));

    match plugin.serve(listener).await {
        Ok(()) => exit(0),
        Err(e) => {
            error!(error = %e, "serve failed");
            exit(1);
        }
    }
}

/// Map a configured level onto a `tracing` filter. `panic` and `fatal` have
/// no direct equivalent and collapse into `error`; unknown levels fall back
/// to `info`.
fn resolve_log_level(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "panic" | "fatal" | "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
    .to_owned()
}

/// Trap the termination signals and stop the plug-in gracefully on the
/// first one received.
fn trap_signals(plugin: Arc<StoragePlugin>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut terminate, mut hangup, mut interrupt, mut quit) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::quit()),
        ) {
            (Ok(terminate), Ok(hangup), Ok(interrupt), Ok(quit)) => {
                (terminate, hangup, interrupt, quit)
            }
            _ => {
                error!("failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = terminate.recv() => {}
            _ = hangup.recv() => {}
            _ = interrupt.recv() => {}
            _ = quit.recv() => {}
        }
        info!("received signal; shutting down");
        plugin.graceful_stop().await;
        exit(0);
    });
}

fn print_usage(app_name: &str, app_description: &str, app_usage: &str) {
    let bin = std::env::args().next().unwrap_or_else(|| "csi-plugin".to_owned());
    eprintln!("{app_name}");
    eprintln!("{app_description}");
    eprintln!();
    eprintln!("USAGE");
    eprintln!("  {bin}");
    eprintln!();
    eprintln!("  The plug-in is configured entirely through options;");
    eprintln!("  CSI_ENDPOINT names the listen address and is required.");
    if !app_usage.is_empty() {
        eprintln!();
        eprintln!("{app_usage}");
    }
}
