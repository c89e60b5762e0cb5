//! Prometheus metrics endpoint.
//!
//! Serves per-queue steering counters (read from the per-CPU `QUEUE_STATS`
//! map) and AF_XDP sink counters in Prometheus exposition format.

use std::fmt::Write as _;
use std::net::SocketAddrV4;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use tokio::sync::Mutex;
use tracing::info;
use ts_steer_common::{PassReason, QueueStats};

use crate::af_xdp::SinkStats;
use crate::config::MetricsConfig;
use crate::ebpf_manager::EbpfManager;

// ---------------------------------------------------------------------------
// Metrics State
// ---------------------------------------------------------------------------

/// Shared state for the metrics endpoint.
#[derive(Clone)]
pub struct MetricsState {
    /// eBPF manager for reading per-CPU stats maps. `None` once shut down.
    pub ebpf_manager: Arc<Mutex<Option<EbpfManager>>>,
    /// Bound queues, in configuration order.
    pub queues: Arc<Vec<u32>>,
    /// Sink counters per bound queue.
    pub sinks: Arc<Vec<(u32, Arc<SinkStats>)>>,
}

// ---------------------------------------------------------------------------
// HTTP Server
// ---------------------------------------------------------------------------

/// Start the Prometheus metrics HTTP server.
pub async fn serve_metrics(config: &MetricsConfig, state: MetricsState) -> Result<()> {
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding metrics server to {}", config.bind))?;

    info!(bind = %config.bind, path = %config.path, "metrics server started");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Metrics Handler
// ---------------------------------------------------------------------------

const PASS_REASONS: [PassReason; 7] = [
    PassReason::Unbound,
    PassReason::NotIpv4,
    PassReason::NotUdp,
    PassReason::Truncated,
    PassReason::Malformed,
    PassReason::PortFiltered,
    PassReason::NoTarget,
];

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let mut output = String::with_capacity(4096);

    let mut queue_stats = Vec::with_capacity(state.queues.len());
    if let Some(ref mgr) = *state.ebpf_manager.lock().await {
        for &queue in state.queues.iter() {
            match mgr.read_stats(queue) {
                Ok(stats) => queue_stats.push((queue, stats)),
                Err(e) => {
                    let _ = writeln!(output, "# ERROR reading eBPF stats for queue {}: {}", queue, e);
                }
            }
        }
    }

    let sinks: Vec<(u32, u64, u64)> = state
        .sinks
        .iter()
        .map(|(queue, stats)| (*queue, stats.frames.load(Relaxed), stats.bytes.load(Relaxed)))
        .collect();

    let groups: Vec<(u32, SocketAddrV4, u64)> = state
        .sinks
        .iter()
        .flat_map(|(queue, stats)| {
            stats
                .payload_by_group()
                .into_iter()
                .map(move |(dst, bytes)| (*queue, dst, bytes))
        })
        .collect();

    write_queue_stats(&mut output, &queue_stats);
    write_sink_stats(&mut output, &sinks);
    write_group_stats(&mut output, &groups);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

fn write_header(output: &mut String, metric: &str, help: &str) {
    let _ = writeln!(output, "# HELP {} {}", metric, help);
    let _ = writeln!(output, "# TYPE {} counter", metric);
}

fn write_queue_stats(output: &mut String, queues: &[(u32, QueueStats)]) {
    if queues.is_empty() {
        return;
    }

    write_header(
        output,
        "ts_steer_packets_redirected_total",
        "Packets redirected to the AF_XDP socket",
    );
    for (queue, stats) in queues {
        let _ = writeln!(
            output,
            "ts_steer_packets_redirected_total{{queue=\"{}\"}} {}",
            queue, stats.redirected
        );
    }

    write_header(
        output,
        "ts_steer_redirect_failed_total",
        "Redirects the kernel rejected (packet passed instead)",
    );
    for (queue, stats) in queues {
        let _ = writeln!(
            output,
            "ts_steer_redirect_failed_total{{queue=\"{}\"}} {}",
            queue, stats.redirect_failed
        );
    }

    write_header(
        output,
        "ts_steer_packets_passed_total",
        "Packets left to the kernel stack, by reason",
    );
    for (queue, stats) in queues {
        for reason in PASS_REASONS {
            let _ = writeln!(
                output,
                "ts_steer_packets_passed_total{{queue=\"{}\",reason=\"{}\"}} {}",
                queue,
                reason.as_str(),
                passed(stats, reason)
            );
        }
    }
}

fn write_sink_stats(output: &mut String, sinks: &[(u32, u64, u64)]) {
    if sinks.is_empty() {
        return;
    }

    write_header(output, "ts_steer_sink_frames_total", "Frames drained from the AF_XDP socket");
    for (queue, frames, _) in sinks {
        let _ = writeln!(output, "ts_steer_sink_frames_total{{queue=\"{}\"}} {}", queue, frames);
    }

    write_header(output, "ts_steer_sink_bytes_total", "Bytes drained from the AF_XDP socket");
    for (queue, _, bytes) in sinks {
        let _ = writeln!(output, "ts_steer_sink_bytes_total{{queue=\"{}\"}} {}", queue, bytes);
    }
}

fn write_group_stats(output: &mut String, groups: &[(u32, SocketAddrV4, u64)]) {
    if groups.is_empty() {
        return;
    }

    write_header(
        output,
        "ts_steer_group_payload_bytes_total",
        "UDP payload bytes drained per destination group",
    );
    for (queue, dst, bytes) in groups {
        let _ = writeln!(
            output,
            "ts_steer_group_payload_bytes_total{{queue=\"{}\",group=\"{}\",port=\"{}\"}} {}",
            queue,
            dst.ip(),
            dst.port(),
            bytes
        );
    }
}

fn passed(stats: &QueueStats, reason: PassReason) -> u64 {
    match reason {
        PassReason::Unbound => stats.passed_unbound,
        PassReason::NotIpv4 => stats.passed_not_ipv4,
        PassReason::NotUdp => stats.passed_not_udp,
        PassReason::Truncated => stats.passed_truncated,
        PassReason::Malformed => stats.passed_malformed,
        PassReason::PortFiltered => stats.passed_port_filtered,
        PassReason::NoTarget => stats.passed_no_target,
    }
}
