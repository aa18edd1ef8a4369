//! Wiretap - HTTP/HTTPS debugging proxy.
//!
//! Prints every request and response passing through the proxy, optionally
//! with headers and bodies. HTTPS traffic to hosts matching `--hostmatch`
//! is decrypted with a locally generated CA; other hosts are tunneled
//! untouched.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wiretap_core::{HostFilter, LineFormat, WriterSink, MATCH_ALL};
use wiretap_proxy::{CaManager, InspectorConfig, ProxyConfig, ProxyServer};

/// When to color body text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Color when stdout is a terminal
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn enabled(self) -> bool {
        match self {
            ColorChoice::Auto => std::io::stdout().is_terminal(),
            ColorChoice::Always => true,
            ColorChoice::Never => false,
        }
    }
}

/// HTTP/HTTPS proxy for debugging
#[derive(Parser, Debug)]
#[command(name = "wiretap", version, about)]
struct Args {
    /// Proxy listen address (":8080" listens on all interfaces)
    #[arg(long, default_value = "0.0.0.0:8080", value_parser = parse_listen_addr)]
    addr: SocketAddr,

    /// HTTPS hosts to decrypt (regexp pattern); plain HTTP is always traced
    #[arg(long, default_value = MATCH_ALL)]
    hostmatch: String,

    /// Verbose output from the proxy engine
    #[arg(short, long)]
    verbose: bool,

    /// Print request and response bodies
    #[arg(long)]
    show_body: bool,

    /// Print request and response headers
    #[arg(long)]
    show_header: bool,

    /// Directory holding the root CA (generated on first run)
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Color body text
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Omit the timestamp in front of each record
    #[arg(long)]
    no_timestamps: bool,

    /// Print at most this many bytes per body chunk (0 = everything)
    #[arg(long, default_value_t = 0)]
    max_body_preview: usize,

    /// Diagnostics log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write diagnostics to daily-rotated files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Accepts `host:port` or a bare `:port`.
fn parse_listen_addr(value: &str) -> Result<SocketAddr, String> {
    let full = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    full.parse()
        .map_err(|e| format!("invalid listen address {value:?}: {e}"))
}

fn log_filter(args: &Args) -> EnvFilter {
    let engine_level = if args.verbose { "debug" } else { "warn" };

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "wiretap_app={level},wiretap_core={level},wiretap_proxy={level},hudsucker={engine_level},warn",
            level = args.log_level
        ))
    })
}

/// Diagnostics go to stderr (and optionally a file); stdout carries the
/// traffic records.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = log_filter(args);
    let console = fmt::layer().with_writer(std::io::stderr);

    if let Some(log_dir) = &args.log_dir {
        let appender = std::fs::create_dir_all(log_dir).ok().and_then(|()| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("wiretap")
                .filename_suffix("log")
                .build(log_dir)
                .ok()
        });

        if let Some(appender) = appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .init();
        tracing::warn!("File logging unavailable in {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .init();
    None
}

fn inspector_config(args: &Args) -> anyhow::Result<InspectorConfig> {
    let host_filter = HostFilter::new(&args.hostmatch).context("invalid --hostmatch")?;
    let format = LineFormat::new()
        .with_color(args.color.enabled())
        .with_max_preview(args.max_body_preview);

    Ok(InspectorConfig::new()
        .with_host_filter(host_filter)
        .with_show_body(args.show_body)
        .with_show_headers(args.show_header)
        .with_format(format))
}

fn proxy_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let ca_manager = match &args.ca_dir {
        Some(dir) => CaManager::new(dir),
        None => CaManager::with_default_dir().context("cannot locate a data directory for the CA")?,
    };

    Ok(ProxyConfig {
        addr: args.addr,
        ca_manager,
        inspector: inspector_config(args)?,
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = proxy_config(&args)?;
    let sink = Arc::new(WriterSink::stdout().with_timestamps(!args.no_timestamps));

    let server = ProxyServer::new(config, sink).context("failed to prepare the root CA")?;
    tracing::info!(
        "Trust {:?} in your client to inspect HTTPS traffic",
        server.ca_cert_path()
    );

    server
        .run()
        .await
        .with_context(|| format!("proxy on {} failed", args.addr))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = init_logging(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
