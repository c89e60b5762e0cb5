//! Map-backed views of the steering tables and the per-packet entry logic.
//!
//! The decision itself is `ts_steer_common::classify`; this module only
//! supplies the XDP packet window and the eBPF maps behind its traits, then
//! turns the outcome into an XDP action.

use aya_ebpf::{bindings::xdp_action, programs::XdpContext};
use ts_steer_common::{
    classify, Outcome, PacketBytes, PortFilter, QueueBindings, RedirectTargets,
};

use crate::{FILTER_CONFIG, PORT_FILTER, QUEUE_BINDINGS, QUEUE_STATS, XSKS_MAP};

/// The `data..data_end` window of the current packet.
struct XdpPacket {
    start: usize,
    end: usize,
}

impl PacketBytes for XdpPacket {
    #[inline(always)]
    fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let at = self.start + offset;
        // Compared against data_end so the verifier sees the bound.
        if at + N > self.end {
            return None;
        }
        Some(unsafe { (at as *const [u8; N]).read_unaligned() })
    }
}

struct MapBindings;

impl QueueBindings for MapBindings {
    #[inline(always)]
    fn is_bound(&self, queue: u32) -> bool {
        matches!(QUEUE_BINDINGS.get(queue), Some(flag) if *flag != 0)
    }
}

struct MapPortFilter;

impl PortFilter for MapPortFilter {
    #[inline(always)]
    fn matches(&self, dst_port: u16) -> bool {
        let port_count = FILTER_CONFIG.get(0).map(|c| c.port_count).unwrap_or(0);
        port_count == 0 || unsafe { PORT_FILTER.get(&dst_port) }.is_some()
    }
}

/// Redirect targets are XSKMAP slots; the handle is the slot index.
struct XskTargets;

impl RedirectTargets for XskTargets {
    type Handle = u32;

    #[inline(always)]
    fn target(&self, queue: u32) -> Option<u32> {
        XSKS_MAP.get(queue).map(|_| queue)
    }
}

/// Classify the packet, count the outcome and return the XDP action.
#[inline(always)]
pub fn steer(ctx: &XdpContext) -> u32 {
    let queue = unsafe { (*ctx.ctx).rx_queue_index };
    let packet = XdpPacket {
        start: ctx.data(),
        end: ctx.data_end(),
    };

    let outcome = classify(&packet, queue, &MapBindings, &MapPortFilter, &XskTargets);

    let mut redirect_failed = false;
    let action = match outcome {
        // XDP_PASS in the flags is the fallback if the slot emptied meanwhile.
        Outcome::Redirect(slot) => match XSKS_MAP.redirect(slot, xdp_action::XDP_PASS as u64) {
            Ok(action) => action,
            Err(_) => {
                redirect_failed = true;
                xdp_action::XDP_PASS
            }
        },
        Outcome::Pass(_) => xdp_action::XDP_PASS,
    };

    if let Some(stats) = QUEUE_STATS.get_ptr_mut(queue) {
        unsafe {
            if redirect_failed {
                (*stats).redirect_failed += 1;
            } else {
                (*stats).record(&outcome);
            }
        }
    }

    action
}
