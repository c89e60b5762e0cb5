//! XDP program steering MPEG2-TS/UDP traffic to AF_XDP consumers.
//!
//! Attached to the XDP hook of the capture interface. For every packet it
//! checks whether a consumer is bound to the receive queue the packet arrived
//! on and, if the packet is UDP/IPv4 to a port of interest, redirects it to
//! that queue's AF_XDP socket. Everything else goes on to the kernel stack.

#![no_std]
#![no_main]

use aya_ebpf::{
    macros::{map, xdp},
    maps::{Array, HashMap, PerCpuArray, XskMap},
    programs::XdpContext,
};

use ts_steer_common::*;

mod steer;

// ---------------------------------------------------------------------------
// eBPF Maps
// ---------------------------------------------------------------------------

/// AF_XDP sockets. Index = receive queue. Userspace registers one socket per
/// bound queue.
#[map]
static XSKS_MAP: XskMap = XskMap::with_max_entries(MAX_QUEUES, 0);

/// Consumer-bound flags. Index = receive queue, non-zero = bound.
#[map]
static QUEUE_BINDINGS: Array<u32> = Array::with_max_entries(MAX_QUEUES, 0);

/// Destination ports of interest (host byte order). Value unused.
#[map]
static PORT_FILTER: HashMap<u16, u8> = HashMap::with_max_entries(MAX_FILTER_PORTS, 0);

/// Single entry: how many ports `PORT_FILTER` holds (0 = any port).
#[map]
static FILTER_CONFIG: Array<FilterConfig> = Array::with_max_entries(1, 0);

/// Per-CPU outcome counters. Index = receive queue.
#[map]
static QUEUE_STATS: PerCpuArray<QueueStats> = PerCpuArray::with_max_entries(MAX_QUEUES, 0);

// ---------------------------------------------------------------------------
// XDP Entry Point
// ---------------------------------------------------------------------------

/// Returns:
/// - `XDP_REDIRECT`: packet handed to the AF_XDP socket bound to its queue
/// - `XDP_PASS`: packet continues through the kernel stack
#[xdp]
pub fn ts_steer(ctx: XdpContext) -> u32 {
    steer::steer(&ctx)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
