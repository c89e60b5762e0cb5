//! Shared core between the ts-steer control plane and the XDP program.
//!
//! This crate is `no_std` so the XDP program can link it. It holds the
//! packet parsers, the port filter and the redirect decision engine, plus
//! the map ABI types. All map types are `repr(C)` for a stable layout across
//! eBPF and user space.

#![cfg_attr(not(test), no_std)]

pub mod cursor;
pub mod engine;
pub mod filter;
pub mod parse;

#[cfg(test)]
mod frames;

pub use cursor::{HeaderCursor, PacketBytes, ParseError};
pub use engine::{classify, Outcome, PassReason, PortFilter, QueueBindings, RedirectTargets};
pub use filter::{AnyPort, PortSet, PortSetError};

/// Number of receive queues the binding registry and redirect table cover.
pub const MAX_QUEUES: u32 = 256;

/// Maximum number of ports in the destination-port filter.
pub const MAX_FILTER_PORTS: u32 = 64;

// ---------------------------------------------------------------------------
// eBPF Map Key/Value Types
// ---------------------------------------------------------------------------

/// Port filter configuration, stored at index 0 of `FILTER_CONFIG`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Number of ports loaded into `PORT_FILTER`. Zero means match any port.
    pub port_count: u32,
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for FilterConfig {}

/// Per-CPU classification counters for one receive queue.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub redirected: u64,
    pub redirect_failed: u64,
    pub passed_unbound: u64,
    pub passed_not_ipv4: u64,
    pub passed_not_udp: u64,
    pub passed_truncated: u64,
    pub passed_malformed: u64,
    pub passed_port_filtered: u64,
    pub passed_no_target: u64,
}

impl QueueStats {
    /// Count one classification outcome.
    #[inline(always)]
    pub fn record<H>(&mut self, outcome: &Outcome<H>) {
        match outcome {
            Outcome::Redirect(_) => self.redirected += 1,
            Outcome::Pass(reason) => match reason {
                PassReason::Unbound => self.passed_unbound += 1,
                PassReason::NotIpv4 => self.passed_not_ipv4 += 1,
                PassReason::NotUdp => self.passed_not_udp += 1,
                PassReason::Truncated => self.passed_truncated += 1,
                PassReason::Malformed => self.passed_malformed += 1,
                PassReason::PortFiltered => self.passed_port_filtered += 1,
                PassReason::NoTarget => self.passed_no_target += 1,
            },
        }
    }

    /// Add another CPU's counters into this one.
    pub fn accumulate(&mut self, other: &QueueStats) {
        self.redirected += other.redirected;
        self.redirect_failed += other.redirect_failed;
        self.passed_unbound += other.passed_unbound;
        self.passed_not_ipv4 += other.passed_not_ipv4;
        self.passed_not_udp += other.passed_not_udp;
        self.passed_truncated += other.passed_truncated;
        self.passed_malformed += other.passed_malformed;
        self.passed_port_filtered += other.passed_port_filtered;
        self.passed_no_target += other.passed_no_target;
    }
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for QueueStats {}

// ---------------------------------------------------------------------------
// eBPF Map and Program Names (must match between eBPF program and loader)
// ---------------------------------------------------------------------------

/// XDP program name.
pub const PROGRAM_NAME: &str = "ts_steer";

/// Map name: XskMap — queue index to AF_XDP socket.
pub const MAP_XSKS: &str = "XSKS_MAP";

/// Map name: Array<u32> — queue index to bound flag (non-zero = bound).
pub const MAP_QUEUE_BINDINGS: &str = "QUEUE_BINDINGS";

/// Map name: HashMap<u16, u8> — destination ports of interest (host order).
pub const MAP_PORT_FILTER: &str = "PORT_FILTER";

/// Map name: Array<FilterConfig> — single entry at index 0.
pub const MAP_FILTER_CONFIG: &str = "FILTER_CONFIG";

/// Map name: PerCpuArray<QueueStats> — indexed by queue.
pub const MAP_QUEUE_STATS: &str = "QUEUE_STATS";

// ---------------------------------------------------------------------------
// Protocol Constants
// ---------------------------------------------------------------------------

/// Ethernet header size.
pub const ETH_HLEN: usize = 14;

/// 802.1Q / 802.1ad tag size.
pub const VLAN_HLEN: usize = 4;

/// Maximum number of stacked VLAN tags skipped before the inner EtherType.
pub const VLAN_MAX_DEPTH: usize = 2;

/// Minimum IPv4 header size (no options).
pub const IP_HLEN: usize = 20;

/// UDP header size.
pub const UDP_HLEN: usize = 8;

/// Minimum total header size: Eth + IPv4 + UDP.
pub const MIN_HEADER_LEN: usize = ETH_HLEN + IP_HLEN + UDP_HLEN;

/// EtherType for IPv4.
pub const ETH_P_IP: u16 = 0x0800;

/// EtherType for IPv6.
pub const ETH_P_IPV6: u16 = 0x86DD;

/// EtherType for 802.1Q VLAN tags.
pub const ETH_P_8021Q: u16 = 0x8100;

/// EtherType for 802.1ad (QinQ) service tags.
pub const ETH_P_8021AD: u16 = 0x88A8;

/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record_and_accumulate() {
        let mut a = QueueStats::default();
        a.record(&Outcome::Redirect(3u32));
        a.record::<u32>(&Outcome::Pass(PassReason::Unbound));
        a.record::<u32>(&Outcome::Pass(PassReason::PortFiltered));

        let mut b = QueueStats::default();
        b.record(&Outcome::Redirect(3u32));
        b.redirect_failed = 2;

        a.accumulate(&b);
        assert_eq!(a.redirected, 2);
        assert_eq!(a.redirect_failed, 2);
        assert_eq!(a.passed_unbound, 1);
        assert_eq!(a.passed_port_filtered, 1);
        assert_eq!(a.passed_truncated, 0);
    }
}
