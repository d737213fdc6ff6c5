use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use edge_scan::config::{
    ChangeHook, HttpOptions, HttpVersion, ProbeKind, ScanConfig, TlsVersion, TunnelKeys,
    DEFAULT_CF_RANGES, DEFAULT_WARP_RANGES,
};
use edge_scan::engine::{Engine, StopReason};
use edge_scan::types::AddressRecord;
use edge_scan::{logging, netdetect, ports, ranges, server};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProbeArg {
    Tcp,
    Tls,
    Http,
    Http2,
    Http3,
    Quic,
    Warp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TlsArg {
    #[value(name = "1.0")]
    V10,
    #[value(name = "1.1")]
    V11,
    #[value(name = "1.2")]
    V12,
    #[value(name = "1.3")]
    V13,
}

/// edge-scan: keep a small pool of the fastest responsive addresses in large IP ranges.
#[derive(Debug, Clone, Parser)]
#[command(name = "edge-scan", version, long_about = None)]
struct Cli {
    /// Comma-separated CIDRs/IPs, or a file with one per line. Defaults to the
    /// Cloudflare ranges (WARP ranges for `--probe warp`).
    #[arg(long)]
    targets: Option<String>,

    #[arg(long, value_enum, default_value_t = ProbeArg::Http)]
    probe: ProbeArg,

    /// Destination port (ignored by the WARP probe).
    #[arg(long, default_value_t = 443)]
    port: u16,

    /// SNI and Host header; the target address is used when empty.
    #[arg(long, default_value = "www.cloudflare.com")]
    hostname: String,

    #[arg(long, default_value = "/")]
    path: String,

    #[arg(long = "user-agent")]
    user_agent: Option<String>,

    #[arg(long)]
    referrer: Option<String>,

    /// Leave out Accept-Encoding from HTTP requests.
    #[arg(long = "no-compression", default_value_t = false)]
    no_compression: bool,

    #[arg(long = "tls-version", value_enum, default_value_t = TlsArg::V13)]
    tls_version: TlsArg,

    /// Verify certificates and hostnames on TLS connections.
    #[arg(long = "strict-tls", default_value_t = false)]
    strict_tls: bool,

    /// WireGuard private key (base64).
    #[arg(long = "private-key")]
    private_key: Option<String>,

    /// WireGuard peer public key (base64).
    #[arg(long = "peer-key")]
    peer_key: Option<String>,

    /// WireGuard preshared key (base64).
    #[arg(long = "preshared-key")]
    preshared_key: Option<String>,

    /// File with WARP ports (one port or range per line).
    #[arg(long = "warp-ports")]
    warp_ports: Option<PathBuf>,

    #[arg(long = "ipv4-only", default_value_t = false, conflicts_with = "ipv6_only")]
    ipv4_only: bool,

    #[arg(long = "ipv6-only", default_value_t = false)]
    ipv6_only: bool,

    /// Acceptable-latency ceiling.
    #[arg(long = "max-rtt-ms", default_value_t = 400)]
    max_rtt_ms: u64,

    #[arg(long = "pool-size", default_value_t = 8)]
    pool_size: usize,

    /// Seconds an address stays pooled before it must be rediscovered.
    #[arg(long = "ttl-secs", default_value_t = 30)]
    ttl_secs: u64,

    /// Stop once this many addresses qualify.
    #[arg(long)]
    target: Option<usize>,

    #[arg(long = "timeout-ms", default_value_t = 1000)]
    timeout_ms: u64,

    #[arg(long = "handshake-timeout-ms", default_value_t = 1000)]
    handshake_timeout_ms: u64,

    /// HTTP probes: wait this long for the response head after the handshake.
    #[arg(long = "response-timeout-ms", default_value_t = 1000)]
    response_timeout_ms: u64,

    #[arg(long = "batch-size", default_value_t = ranges::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Probes in flight at once.
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// Give up after this many seconds.
    #[arg(long = "duration-secs")]
    duration_secs: Option<u64>,

    /// Write the final pool as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the status API on this address (e.g. 127.0.0.1:8080).
    #[arg(long)]
    serve: Option<String>,

    /// Do not print the pool table on every change.
    #[arg(long, short, default_value_t = false)]
    quiet: bool,

    #[arg(long, short, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let config = build_config(&cli)?;
    info!("{config:?}");

    let engine = Arc::new(Engine::new(config));

    if let Some(bind) = cli.serve.clone() {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = server::serve(&bind, engine).await {
                warn!("status API error: {e:#}");
            }
        });
    }

    let ctrl_c = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.stop();
        }
    });

    let reason = match cli.duration_secs {
        Some(secs) => engine.run_for(Duration::from_secs(secs)).await,
        None => engine.run().await,
    }
    .context("invalid scan configuration")?;

    let pool = engine.available_ips(false);
    if reason == StopReason::GoalReached {
        info!("found {} address(es)", pool.len());
    }
    print_pool_table(&pool);

    if let Some(path) = cli.output.as_deref() {
        write_pool_json(path, &pool)?;
        info!("wrote pool to {}", path.display());
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<ScanConfig> {
    let probe = match cli.probe {
        ProbeArg::Tcp => ProbeKind::Tcp,
        ProbeArg::Tls => ProbeKind::Tls,
        ProbeArg::Quic => ProbeKind::Quic,
        ProbeArg::Http | ProbeArg::Http2 | ProbeArg::Http3 => ProbeKind::Http(HttpOptions {
            version: match cli.probe {
                ProbeArg::Http2 => HttpVersion::Http2,
                ProbeArg::Http3 => HttpVersion::Http3,
                _ => HttpVersion::Http1,
            },
            path: cli.path.clone(),
            user_agent: cli.user_agent.clone().unwrap_or_else(|| HttpOptions::default().user_agent),
            referrer: cli.referrer.clone(),
            disable_compression: cli.no_compression,
        }),
        ProbeArg::Warp => {
            let (Some(private), Some(peer)) = (cli.private_key.as_deref(), cli.peer_key.as_deref())
            else {
                bail!("--probe warp needs --private-key and --peer-key");
            };
            let mut keys = TunnelKeys::from_base64(private, peer, cli.preshared_key.as_deref())?;
            if let Some(path) = cli.warp_ports.as_deref() {
                keys.ports = ports::load_ports_from_path(path)?;
            }
            ProbeKind::Warp(keys)
        }
    };

    let cidrs = match cli.targets.as_deref() {
        Some(t) if Path::new(t).is_file() => ranges::load_cidrs_from_path(t)?,
        Some(t) => ranges::parse_cidr_list(t),
        None if cli.probe == ProbeArg::Warp => DEFAULT_WARP_RANGES.iter().map(|s| s.to_string()).collect(),
        None => DEFAULT_CF_RANGES.iter().map(|s| s.to_string()).collect(),
    };

    let (use_ipv4, use_ipv6) = if cli.ipv4_only {
        (true, false)
    } else if cli.ipv6_only {
        (false, true)
    } else {
        let ipv6 = match netdetect::detect_local_families() {
            Ok(f) => f.ipv6,
            Err(e) => {
                warn!("interface detection failed, IPv6 off: {e:#}");
                false
            }
        };
        (true, ipv6)
    };

    let on_change: Option<ChangeHook> = if cli.quiet {
        None
    } else {
        Some(Arc::new(|pool: &[AddressRecord]| print_pool_table(pool)))
    };

    Ok(ScanConfig {
        cidrs,
        use_ipv4,
        use_ipv6,
        probe,
        port: cli.port,
        hostname: Some(cli.hostname.clone()).filter(|h| !h.is_empty()),
        insecure_skip_verify: !cli.strict_tls,
        tls_version: match cli.tls_version {
            TlsArg::V10 => TlsVersion::Tls10,
            TlsArg::V11 => TlsVersion::Tls11,
            TlsArg::V12 => TlsVersion::Tls12,
            TlsArg::V13 => TlsVersion::Tls13,
        },
        max_rtt: Duration::from_millis(cli.max_rtt_ms),
        queue_capacity: cli.pool_size,
        queue_ttl: Duration::from_secs(cli.ttl_secs),
        target_count: cli.target,
        connect_timeout: Duration::from_millis(cli.timeout_ms),
        handshake_timeout: Duration::from_millis(cli.handshake_timeout_ms),
        response_timeout: Duration::from_millis(cli.response_timeout_ms),
        batch_size: cli.batch_size,
        concurrency: cli.concurrency,
        on_change,
        ..ScanConfig::default()
    })
}

fn print_pool_table(pool: &[AddressRecord]) {
    let addrs: Vec<String> = pool.iter().map(|r| r.socket_addr().to_string()).collect();
    let addr_w = addrs.iter().map(String::len).max().unwrap_or(0).max("address".len());
    let rtt_w = "rtt_ms".len();
    let when_w = 20;

    println!("\nPool: {} address(es)", pool.len());
    println!("{:>3}  {:<addr_w$}  {:>rtt_w$}  {:<when_w$}", "#", "address", "rtt_ms", "discovered");
    println!("{:-<3}  {:-<addr_w$}  {:-<rtt_w$}  {:-<when_w$}", "", "", "", "");
    for (i, (r, addr)) in pool.iter().zip(&addrs).enumerate() {
        let when = r
            .discovered_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("-"));
        println!("{:>3}  {:<addr_w$}  {:>rtt_w$}  {:<when_w$}", i + 1, addr, r.rtt_ms, when);
    }
}

fn write_pool_json(path: &Path, pool: &[AddressRecord]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, pool)?;
    Ok(())
}
