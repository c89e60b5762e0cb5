//! ts-steer: per-queue MPEG2-TS/UDP steering onto AF_XDP sockets.
//!
//! An XDP program on the capture interface redirects UDP/IPv4 packets that
//! arrive on bound receive queues (optionally filtered by destination port)
//! to an AF_XDP socket; everything else continues up the kernel stack.
//!
//! This binary is the control plane: it loads and attaches the program,
//! configures the port filter, joins the multicast groups, opens one AF_XDP
//! sink per queue, binds the queues and serves Prometheus metrics.

mod af_xdp;
mod config;
mod control;
mod ebpf_manager;
mod metrics;
mod multicast;
mod tables;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use ts_steer_common::Outcome;

use af_xdp::XskSink;
use config::Config;
use control::{bind_queue, unbind_queue, ControlPlane};
use ebpf_manager::{interface_index, EbpfManager};
use metrics::MetricsState;
use tables::SteeringTables;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "ts-steer",
    about = "Steer MPEG2-TS/UDP traffic from selected NIC queues onto AF_XDP sockets",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to the compiled eBPF program ELF binary.
    #[arg(long, default_value = "ts-steer-ebpf")]
    ebpf_program: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Attach to the interface and steer until interrupted (default).
    Run,
    /// Classify a captured frame against the configuration, without
    /// touching the kernel.
    Classify {
        /// Receive queue the frame arrived on.
        #[arg(short, long, default_value_t = 0)]
        queue: u32,

        /// File holding one raw Ethernet frame.
        frame: PathBuf,

        /// The file contains hex text instead of raw bytes.
        #[arg(long)]
        hex: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let config = Config::load(&cli.config).context("loading configuration")?;

    match cli.command {
        None | Some(Command::Run) => run(config, &cli.config, &cli.ebpf_program).await,
        Some(Command::Classify { queue, frame, hex }) => classify_frame(&config, queue, &frame, hex),
    }
}

async fn run(config: Config, config_path: &Path, ebpf_program: &Path) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        interface = %config.interface,
        queues = ?config.queues,
        "starting ts-steer"
    );

    let ebpf_bytes = std::fs::read(ebpf_program).with_context(|| {
        format!(
            "reading eBPF program from {}. Build it with: cargo xtask build-ebpf",
            ebpf_program.display()
        )
    })?;

    let mut mgr = EbpfManager::load(&ebpf_bytes)?;
    mgr.configure_port_filter(&config.ports)
        .context("configuring port filter")?;
    mgr.attach(&config.interface, config.attach_mode)?;

    let ifindex = interface_index(&config.interface)?;
    let membership = multicast::join_groups(ifindex, &config.groups)?;

    // --- Open sinks and bind queues ---
    let mut sinks: Vec<XskSink> = Vec::with_capacity(config.queues.len());
    for &queue in &config.queues {
        let sink = XskSink::start(&config.interface, ifindex, queue, &config.sink)?;
        bind_queue(&mut mgr, queue, sink.fd())?;
        sinks.push(sink);
    }

    info!(
        queues = sinks.len(),
        ports = config.ports.len(),
        groups = membership.len(),
        "steering active"
    );

    let ebpf_manager: Arc<Mutex<Option<EbpfManager>>> = Arc::new(Mutex::new(Some(mgr)));

    // --- Start metrics server ---
    let metrics_handle = if config.metrics.enabled {
        let state = MetricsState {
            ebpf_manager: ebpf_manager.clone(),
            queues: Arc::new(config.queues.clone()),
            sinks: Arc::new(sinks.iter().map(|s| (s.queue(), s.stats.clone())).collect()),
        };

        let metrics_config = config.metrics;
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_config, state).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    // --- Wait for shutdown signal ---
    info!("ts-steer is running. Press Ctrl+C to stop.");

    shutdown_signal().await?;

    info!("shutdown signal received, cleaning up...");

    // --- Graceful shutdown ---

    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    let mgr = ebpf_manager.lock().await.take();
    if let Some(mut mgr) = mgr {
        for sink in &sinks {
            if let Err(e) = unbind_queue(&mut mgr, sink.queue()) {
                warn!(queue = sink.queue(), error = %e, "error unbinding queue");
            }
        }
        for sink in sinks {
            sink.shutdown();
        }
        if let Err(e) = mgr.detach() {
            warn!(error = %e, "error detaching XDP program");
        }
    }

    membership.leave();

    info!("ts-steer stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Offline Classification
// ---------------------------------------------------------------------------

fn classify_frame(config: &Config, queue: u32, path: &Path, hex: bool) -> Result<()> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let frame = if hex {
        let text = String::from_utf8(raw).context("hex frame is not UTF-8")?;
        parse_hex(&text)?
    } else {
        raw
    };

    let tables: SteeringTables<u32> = SteeringTables::new();
    let mut plane = &tables;
    plane.configure_port_filter(&config.ports)?;
    for &q in &config.queues {
        bind_queue(&mut plane, q, q)?;
    }
    debug!(ports = ?tables.port_filter(), queues = ?config.queues, "steering tables ready");

    match tables.classify(&frame, queue) {
        Outcome::Redirect(target) => println!("redirect queue={} target={}", queue, target),
        Outcome::Pass(reason) => println!("pass queue={} reason={}", queue, reason.as_str()),
    }
    Ok(())
}

/// Decode hex text. Whitespace and `:` / `-` separators are ignored.
fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':' && *b != b'-')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("odd number of hex digits ({})", digits.len());
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            let hi = hex_value(pair[0])?;
            let lo = hex_value(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_value(digit: u8) -> Result<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => bail!("invalid hex digit {:?}", digit as char),
    }
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;

        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("waiting for Ctrl+C")?;
                info!("received Ctrl+C");
            }
            _ = terminate.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("waiting for Ctrl+C")?;
        info!("received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert_eq!(parse_hex("0800 45").unwrap(), vec![0x08, 0x00, 0x45]);
        assert_eq!(
            parse_hex("01:00:5e:18:09:0d\nAB-cd").unwrap(),
            vec![0x01, 0x00, 0x5e, 0x18, 0x09, 0x0d, 0xab, 0xcd]
        );
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["ts-steer", "-c", "steer.yaml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("steer.yaml"));
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["ts-steer", "classify", "--queue", "3", "--hex", "f.txt"])
            .unwrap();
        match cli.command {
            Some(Command::Classify { queue, frame, hex }) => {
                assert_eq!(queue, 3);
                assert_eq!(frame, PathBuf::from("f.txt"));
                assert!(hex);
            }
            _ => panic!("expected classify"),
        }
    }
}
