//! eBPF program lifecycle manager.
//!
//! Loads the compiled XDP program, attaches it to the capture interface and
//! owns the steering maps: queue bindings, XSK redirect targets and the port
//! filter. Detaches the program on shutdown.

use std::collections::HashSet;
use std::os::fd::RawFd;

use anyhow::{anyhow, bail, Context, Result};
use aya::maps::{Array, HashMap, MapData, PerCpuArray, XskMap};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use tracing::{debug, info, warn};

use crate::config::AttachMode;
use crate::control::{check_queue, ControlPlane};
use ts_steer_common::*;

// ---------------------------------------------------------------------------
// Public Interface
// ---------------------------------------------------------------------------

/// Manages the XDP program and the maps it classifies against.
pub struct EbpfManager {
    bpf: Ebpf,
    link: Option<(String, XdpLinkId)>,
    /// Queues with a socket published in `XSKS_MAP`.
    published: HashSet<u32>,
    /// Queues whose binding flag is set.
    bound: HashSet<u32>,
}

impl EbpfManager {
    /// Load the eBPF object. Nothing is attached yet and every queue is unbound.
    pub fn load(ebpf_bytes: &[u8]) -> Result<Self> {
        let bpf = Ebpf::load(ebpf_bytes).context("loading eBPF program")?;

        Ok(Self {
            bpf,
            link: None,
            published: HashSet::new(),
            bound: HashSet::new(),
        })
    }

    /// Load the XDP program into the kernel and attach it to `iface`.
    pub fn attach(&mut self, iface: &str, mode: AttachMode) -> Result<()> {
        if self.link.is_some() {
            bail!("XDP program already attached");
        }

        let program: &mut Xdp = self
            .bpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("eBPF program '{}' not found", PROGRAM_NAME))?
            .try_into()
            .context("program type mismatch (expected Xdp)")?;

        program.load().context("loading XDP program")?;

        let link_id = program
            .attach(iface, attach_flags(mode))
            .with_context(|| format!("attaching XDP program to {} ({:?} mode)", iface, mode))?;

        info!(interface = iface, mode = ?mode, "attached XDP program");
        self.link = Some((iface.to_string(), link_id));

        Ok(())
    }

    /// Read outcome counters for a queue (summed across all CPUs).
    pub fn read_stats(&self, queue: u32) -> Result<QueueStats> {
        let stats_map: PerCpuArray<_, QueueStats> = self
            .bpf
            .map(MAP_QUEUE_STATS)
            .context("QUEUE_STATS map not found")?
            .try_into()
            .context("QUEUE_STATS map type mismatch")?;

        let per_cpu = stats_map.get(&queue, 0).context("reading QUEUE_STATS entry")?;

        let mut agg = QueueStats::default();
        for entry in per_cpu.iter() {
            agg.accumulate(entry);
        }

        Ok(agg)
    }

    /// Detach the XDP program. Called on shutdown, after queues are unbound.
    pub fn detach(mut self) -> Result<()> {
        if !self.bound.is_empty() {
            warn!(queues = ?self.bound, "detaching with queues still bound");
        }

        let Some((iface, link_id)) = self.link.take() else {
            return Ok(());
        };

        info!(interface = %iface, "detaching XDP program");

        let program: &mut Xdp = self
            .bpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("eBPF program '{}' not found", PROGRAM_NAME))?
            .try_into()
            .context("program type mismatch (expected Xdp)")?;

        program
            .detach(link_id)
            .with_context(|| format!("detaching XDP program from {}", iface))?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Private: Port Filter
    // -----------------------------------------------------------------------

    fn port_filter_map(&mut self) -> Result<HashMap<&mut MapData, u16, u8>> {
        self.bpf
            .map_mut(MAP_PORT_FILTER)
            .context("PORT_FILTER map not found")?
            .try_into()
            .context("PORT_FILTER map type mismatch")
    }

    fn set_filter_count(&mut self, port_count: u32) -> Result<()> {
        let mut config_map: Array<_, FilterConfig> = self
            .bpf
            .map_mut(MAP_FILTER_CONFIG)
            .context("FILTER_CONFIG map not found")?
            .try_into()
            .context("FILTER_CONFIG map type mismatch")?;

        config_map
            .set(0, FilterConfig { port_count }, 0)
            .context("updating filter config")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Control Plane
// ---------------------------------------------------------------------------

impl ControlPlane for EbpfManager {
    /// AF_XDP socket file descriptor.
    type Handle = RawFd;

    fn set_binding(&mut self, queue: u32, bound: bool) -> Result<()> {
        check_queue(queue)?;
        if bound && !self.published.contains(&queue) {
            bail!("queue {} has no published AF_XDP socket", queue);
        }

        let mut bindings: Array<_, u32> = self
            .bpf
            .map_mut(MAP_QUEUE_BINDINGS)
            .context("QUEUE_BINDINGS map not found")?
            .try_into()
            .context("QUEUE_BINDINGS map type mismatch")?;

        bindings
            .set(queue, u32::from(bound), 0)
            .context("updating queue binding")?;

        if bound {
            self.bound.insert(queue);
        } else {
            self.bound.remove(&queue);
        }

        info!(queue, bound, "updated queue binding");
        Ok(())
    }

    fn set_redirect_target(&mut self, queue: u32, target: Option<RawFd>) -> Result<()> {
        check_queue(queue)?;

        match target {
            Some(fd) => {
                let mut xsks: XskMap<_> = self
                    .bpf
                    .map_mut(MAP_XSKS)
                    .context("XSKS_MAP map not found")?
                    .try_into()
                    .context("XSKS_MAP map type mismatch")?;

                xsks.set(queue, fd, 0)
                    .context("registering AF_XDP socket in XSKS_MAP")?;
                self.published.insert(queue);

                info!(queue, fd, "published AF_XDP socket");
            }
            None => {
                if self.bound.contains(&queue) {
                    bail!("queue {} is still bound; clear the binding first", queue);
                }
                // The kernel drops the XSKS_MAP entry when the socket closes.
                self.published.remove(&queue);
                debug!(queue, "withdrew AF_XDP socket");
            }
        }

        Ok(())
    }

    fn configure_port_filter(&mut self, ports: &[u16]) -> Result<()> {
        let set = PortSet::new(ports).map_err(|e| anyhow!("{}", e))?;

        let existing: Vec<u16> = self
            .port_filter_map()?
            .keys()
            .collect::<std::result::Result<_, _>>()
            .context("listing PORT_FILTER keys")?;

        if set.is_empty() {
            // Switch to match-any before emptying the map.
            self.set_filter_count(0)?;
            let mut filter = self.port_filter_map()?;
            for port in existing {
                filter.remove(&port).context("removing port from filter")?;
            }
            info!("port filter cleared, steering every UDP port");
            return Ok(());
        }

        // Insert before removing so a port in both the old and the new set
        // keeps matching while the map is rewritten.
        let mut filter = self.port_filter_map()?;
        for &port in set.as_slice() {
            filter.insert(port, 1u8, 0).context("inserting port into filter")?;
        }
        for port in existing {
            if !set.contains(port) {
                filter.remove(&port).context("removing port from filter")?;
            }
        }

        self.set_filter_count(set.len() as u32)?;

        info!(ports = ?set.as_slice(), "port filter configured");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn attach_flags(mode: AttachMode) -> XdpFlags {
    match mode {
        AttachMode::Default => XdpFlags::default(),
        AttachMode::Skb => XdpFlags::SKB_MODE,
        AttachMode::Driver => XdpFlags::DRV_MODE,
        AttachMode::Hardware => XdpFlags::HW_MODE,
    }
}

/// Get the interface index for a network interface name.
pub fn interface_index(iface: &str) -> Result<u32> {
    let idx = nix::net::if_::if_nametoindex(iface)
        .with_context(|| format!("interface '{}' not found", iface))?;
    Ok(idx)
}
