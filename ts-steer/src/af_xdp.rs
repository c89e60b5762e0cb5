//! AF_XDP consumer sockets.
//!
//! One [`XskSink`] per bound receive queue. The XDP program redirects
//! matching frames into the socket's RX ring; a drain thread counts them and
//! hands the UMEM frames straight back to the fill ring. Only the headers
//! are read, to count UDP payload bytes per destination group.
//!
//! Layout:
//! 1. UMEM: `2 * ring_size` frames of `frame_size` bytes, registered with
//!    the socket.
//! 2. Fill ring (user → kernel) and RX ring (kernel → user), mmap'd.
//! 3. Bind to (ifindex, queue) in copy mode, so any driver works.
//! 4. The socket fd is then published in `XSKS_MAP` by the caller.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};
use ts_steer_common::parse::{parse_ethernet, parse_ipv4, parse_udp};
use ts_steer_common::{HeaderCursor, ETH_P_IP, IPPROTO_UDP, UDP_HLEN};

use crate::config::SinkSettings;

// ---------------------------------------------------------------------------
// Kernel ABI (linux/if_xdp.h)
// ---------------------------------------------------------------------------

const SOL_XDP: i32 = 283;
const XDP_MMAP_OFFSETS: i32 = 1;
const XDP_RX_RING: i32 = 2;
const XDP_UMEM_REG: i32 = 4;
const XDP_UMEM_FILL_RING: i32 = 5;
const XDP_UMEM_COMPLETION_RING: i32 = 6;

const XDP_PGOFF_RX_RING: i64 = 0;
const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x1_0000_0000;

const XDP_COPY: u16 = 1 << 1;

/// Descriptors drained per wakeup.
const RX_BATCH: u32 = 64;

/// Poll timeout, bounds how long shutdown waits on an idle queue.
const POLL_TIMEOUT_MS: i32 = 100;

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
    tx_metadata_len: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset,
    cr: XdpRingOffset,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct XdpDesc {
    addr: u64,
    len: u32,
    options: u32,
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

// ---------------------------------------------------------------------------
// Public Interface
// ---------------------------------------------------------------------------

/// Frames and bytes drained from one queue's socket.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    /// UDP payload bytes per destination (group, port).
    groups: Mutex<HashMap<SocketAddrV4, u64>>,
}

impl SinkStats {
    fn add_payload(&self, batch: &HashMap<SocketAddrV4, u64>) {
        if batch.is_empty() {
            return;
        }
        let mut groups = match self.groups.lock() {
            Ok(groups) => groups,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (dst, bytes) in batch {
            *groups.entry(*dst).or_insert(0) += bytes;
        }
    }

    /// Payload byte counters, sorted by destination.
    pub fn payload_by_group(&self) -> Vec<(SocketAddrV4, u64)> {
        let groups = match self.groups.lock() {
            Ok(groups) => groups,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<_> = groups.iter().map(|(dst, bytes)| (*dst, *bytes)).collect();
        out.sort_by_key(|(dst, _)| (*dst.ip(), dst.port()));
        out
    }
}

/// A bound AF_XDP socket plus the thread draining it.
pub struct XskSink {
    queue: u32,
    fd: RawFd,
    thread: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pub stats: Arc<SinkStats>,
}

impl XskSink {
    /// Create the socket for `queue` on `ifindex` and start draining it.
    pub fn start(iface: &str, ifindex: u32, queue: u32, settings: &SinkSettings) -> Result<Self> {
        let mut xsk = XskSocket::create(ifindex, queue, settings)
            .with_context(|| format!("creating AF_XDP socket for {} queue {}", iface, queue))?;
        xsk.prefill();

        let fd = xsk.fd;
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SinkStats::default());

        let shutdown_clone = shutdown.clone();
        let stats_clone = stats.clone();

        let thread = thread::Builder::new()
            .name(format!("xsk-q{}", queue))
            .spawn(move || {
                if let Err(e) = drain(xsk, &shutdown_clone, &stats_clone) {
                    error!(queue, error = %e, "AF_XDP drain exited with error");
                }
            })
            .context("spawning AF_XDP drain thread")?;

        info!(
            interface = iface,
            queue,
            fd,
            ring_size = settings.ring_size,
            frame_size = settings.frame_size,
            "AF_XDP sink started"
        );

        Ok(Self {
            queue,
            fd,
            thread: Some(thread),
            shutdown,
            stats,
        })
    }

    /// Socket fd to publish in `XSKS_MAP`. Valid until [`XskSink::shutdown`].
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn queue(&self) -> u32 {
        self.queue
    }

    /// Stop the drain thread. The socket closes with it, which also removes
    /// its `XSKS_MAP` entry.
    pub fn shutdown(self) {
        debug!(queue = self.queue, "stopping AF_XDP sink");
        drop(self);
    }
}

impl Drop for XskSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Drain Loop
// ---------------------------------------------------------------------------

fn drain(mut xsk: XskSocket, shutdown: &AtomicBool, stats: &SinkStats) -> Result<()> {
    let mut pollfd = libc::pollfd {
        fd: xsk.fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let mut batch: Vec<XdpDesc> = Vec::with_capacity(RX_BATCH as usize);
    let mut recycle: Vec<u64> = Vec::with_capacity(RX_BATCH as usize);
    let mut payload: HashMap<SocketAddrV4, u64> = HashMap::new();

    while !shutdown.load(Ordering::Acquire) {
        pollfd.revents = 0;
        let ret = unsafe { libc::poll(&mut pollfd, 1, POLL_TIMEOUT_MS) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("polling AF_XDP socket");
        }
        if ret == 0 {
            continue;
        }

        if xsk.poll_rx(&mut batch) == 0 {
            continue;
        }

        recycle.clear();
        payload.clear();
        for desc in &batch {
            stats.frames.fetch_add(1, Ordering::Relaxed);
            stats.bytes.fetch_add(u64::from(desc.len), Ordering::Relaxed);
            if let Some((dst, bytes)) = xsk.frame(desc).and_then(udp_payload) {
                *payload.entry(dst).or_insert(0) += bytes;
            }
            recycle.push(frame_base(desc.addr, xsk.frame_size));
        }
        stats.add_payload(&payload);

        if let Err(e) = xsk.refill(&recycle) {
            warn!(queue = xsk.queue, error = %e, "failed to recycle AF_XDP frames");
        }
    }

    debug!(queue = xsk.queue, "AF_XDP drain loop exited");
    Ok(())
}

/// Destination and UDP payload length of a redirected frame.
fn udp_payload(frame: &[u8]) -> Option<(SocketAddrV4, u64)> {
    let mut cursor = HeaderCursor::new(frame);
    if parse_ethernet(&mut cursor).ok()?.ether_type != ETH_P_IP {
        return None;
    }
    let ip = parse_ipv4(&mut cursor).ok()?;
    if ip.protocol != IPPROTO_UDP {
        return None;
    }
    let udp = parse_udp(&mut cursor).ok()?;
    let dst = SocketAddrV4::new(Ipv4Addr::from(ip.dst), udp.dst_port);
    Some((dst, u64::from(udp.length) - UDP_HLEN as u64))
}

/// Start of the UMEM frame holding `addr`. RX descriptors may point past
/// the frame start when the driver reserves headroom.
fn frame_base(addr: u64, frame_size: u32) -> u64 {
    addr & !(u64::from(frame_size) - 1)
}

// ---------------------------------------------------------------------------
// Rings
// ---------------------------------------------------------------------------

/// One mmap'd single-producer/single-consumer ring.
struct Ring {
    producer: *const AtomicU32,
    consumer: *const AtomicU32,
    desc: *mut u8,
    mask: u32,
    map: *mut libc::c_void,
    map_len: usize,
}

impl Ring {
    /// Map the ring at page offset `pgoff` of `fd`. `desc_size` is the size
    /// of one slot.
    fn map(fd: RawFd, pgoff: i64, off: &XdpRingOffset, size: u32, desc_size: usize) -> Result<Self> {
        let map_len = off.desc as usize + size as usize * desc_size;
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).context("mmap ring");
        }

        unsafe {
            Ok(Self {
                producer: map.byte_add(off.producer as usize) as *const AtomicU32,
                consumer: map.byte_add(off.consumer as usize) as *const AtomicU32,
                desc: map.byte_add(off.desc as usize) as *mut u8,
                mask: size - 1,
                map,
                map_len,
            })
        }
    }

    fn producer(&self) -> &AtomicU32 {
        unsafe { &*self.producer }
    }

    fn consumer(&self) -> &AtomicU32 {
        unsafe { &*self.consumer }
    }

    fn slot<T>(&self, index: u32) -> *mut T {
        unsafe { (self.desc as *mut T).add((index & self.mask) as usize) }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map, self.map_len);
        }
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

struct XskSocket {
    fd: RawFd,
    queue: u32,
    umem: *mut libc::c_void,
    umem_len: usize,
    frame_size: u32,
    num_frames: u32,
    ring_size: u32,
    fill: Option<Ring>,
    rx: Option<Ring>,
}

// The raw pointers are owned mappings; the socket moves to the drain thread
// and is used only there.
unsafe impl Send for XskSocket {}

impl XskSocket {
    fn create(ifindex: u32, queue: u32, settings: &SinkSettings) -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).context("creating AF_XDP socket");
        }

        let num_frames = settings.num_frames();
        let umem_len = num_frames as usize * settings.frame_size as usize;
        let umem = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                umem_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if umem == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err).context("mmap UMEM");
        }

        // From here on, Drop releases the fd and mappings on any error.
        let mut xsk = Self {
            fd,
            queue,
            umem,
            umem_len,
            frame_size: settings.frame_size,
            num_frames,
            ring_size: settings.ring_size,
            fill: None,
            rx: None,
        };

        let reg = XdpUmemReg {
            addr: umem as u64,
            len: umem_len as u64,
            chunk_size: settings.frame_size,
            headroom: 0,
            flags: 0,
            tx_metadata_len: 0,
        };
        xsk.setsockopt(XDP_UMEM_REG, &reg).context("XDP_UMEM_REG")?;

        for (opt, name) in [
            (XDP_UMEM_FILL_RING, "fill"),
            (XDP_UMEM_COMPLETION_RING, "completion"),
            (XDP_RX_RING, "rx"),
        ] {
            xsk.setsockopt(opt, &settings.ring_size)
                .with_context(|| format!("setting {} ring size", name))?;
        }

        let mut offsets = XdpMmapOffsets::default();
        let mut optlen = std::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut offsets as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error()).context("XDP_MMAP_OFFSETS");
        }
        debug!(?offsets, "AF_XDP mmap offsets");

        xsk.fill = Some(
            Ring::map(
                fd,
                XDP_UMEM_PGOFF_FILL_RING,
                &offsets.fr,
                settings.ring_size,
                std::mem::size_of::<u64>(),
            )
            .context("mapping fill ring")?,
        );
        xsk.rx = Some(
            Ring::map(
                fd,
                XDP_PGOFF_RX_RING,
                &offsets.rx,
                settings.ring_size,
                std::mem::size_of::<XdpDesc>(),
            )
            .context("mapping RX ring")?,
        );

        xsk.bind(ifindex, queue)?;
        Ok(xsk)
    }

    fn setsockopt<T>(&self, opt: i32, value: &T) -> Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_XDP,
                opt,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Bind in copy mode; retry without flags for kernels that reject it.
    fn bind(&self, ifindex: u32, queue: u32) -> Result<()> {
        let mut addr = SockaddrXdp {
            sxdp_family: libc::AF_XDP as u16,
            sxdp_flags: XDP_COPY,
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue,
            sxdp_shared_umem_fd: 0,
        };

        for attempt in 0..2 {
            let ret = unsafe {
                libc::bind(
                    self.fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrXdp>() as libc::socklen_t,
                )
            };
            if ret == 0 {
                debug!(ifindex, queue, copy = attempt == 0, "AF_XDP socket bound");
                return Ok(());
            }
            addr.sxdp_flags = 0;
        }

        bail!(
            "binding AF_XDP socket to ifindex {} queue {}: {}",
            ifindex,
            queue,
            std::io::Error::last_os_error()
        )
    }

    /// Hand the first `ring_size` frames to the kernel.
    fn prefill(&mut self) {
        let Some(fill) = self.fill.as_ref() else {
            return;
        };
        let frames = self.ring_size.min(self.num_frames);
        for i in 0..frames {
            unsafe { *fill.slot::<u64>(i) = u64::from(i) * u64::from(self.frame_size) };
        }
        fill.producer().store(frames, Ordering::Release);
    }

    /// Copy up to [`RX_BATCH`] descriptors out of the RX ring and release
    /// their slots.
    fn poll_rx(&mut self, batch: &mut Vec<XdpDesc>) -> usize {
        batch.clear();
        let Some(rx) = self.rx.as_ref() else {
            return 0;
        };

        let prod = rx.producer().load(Ordering::Acquire);
        let cons = rx.consumer().load(Ordering::Relaxed);
        let n = prod.wrapping_sub(cons).min(RX_BATCH);

        for i in 0..n {
            batch.push(unsafe { *rx.slot::<XdpDesc>(cons.wrapping_add(i)) });
        }
        rx.consumer().store(cons.wrapping_add(n), Ordering::Release);

        n as usize
    }

    /// Bytes of the frame `desc` points at, if it lies inside the UMEM.
    fn frame(&self, desc: &XdpDesc) -> Option<&[u8]> {
        let start = usize::try_from(desc.addr).ok()?;
        let end = start.checked_add(desc.len as usize)?;
        if end > self.umem_len {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts((self.umem as *const u8).add(start), end - start) })
    }

    /// Return frame addresses to the fill ring.
    fn refill(&mut self, addrs: &[u64]) -> Result<()> {
        let Some(fill) = self.fill.as_ref() else {
            return Ok(());
        };

        let prod = fill.producer().load(Ordering::Relaxed);
        let cons = fill.consumer().load(Ordering::Acquire);
        let free = self.ring_size - prod.wrapping_sub(cons);
        if addrs.len() as u32 > free {
            bail!("fill ring full: need {} slots, have {}", addrs.len(), free);
        }

        for (i, &addr) in addrs.iter().enumerate() {
            unsafe { *fill.slot::<u64>(prod.wrapping_add(i as u32)) = addr };
        }
        fill.producer()
            .store(prod.wrapping_add(addrs.len() as u32), Ordering::Release);

        Ok(())
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        self.rx.take();
        self.fill.take();
        unsafe {
            libc::close(self.fd);
            libc::munmap(self.umem, self.umem_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_base_strips_headroom() {
        assert_eq!(frame_base(0, 4096), 0);
        assert_eq!(frame_base(256, 4096), 0);
        assert_eq!(frame_base(4096 + 256, 4096), 4096);
        assert_eq!(frame_base(3 * 2048 + 100, 2048), 3 * 2048);
    }

    fn udp_frame(dst: [u8; 4], port: u16, payload_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; 12];
        pkt.extend_from_slice(&ETH_P_IP.to_be_bytes());
        let total = (20 + UDP_HLEN + payload_len) as u16;
        pkt.extend_from_slice(&[0x45, 0]);
        pkt.extend_from_slice(&total.to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0, 0, 64, IPPROTO_UDP, 0, 0]);
        pkt.extend_from_slice(&[10, 0, 0, 1]);
        pkt.extend_from_slice(&dst);
        pkt.extend_from_slice(&1234u16.to_be_bytes());
        pkt.extend_from_slice(&port.to_be_bytes());
        pkt.extend_from_slice(&((UDP_HLEN + payload_len) as u16).to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend(std::iter::repeat(0x47).take(payload_len));
        pkt
    }

    #[test]
    fn test_udp_payload_by_destination() {
        let frame = udp_frame([239, 24, 9, 13], 5000, 7 * 188);
        assert_eq!(
            udp_payload(&frame),
            Some((SocketAddrV4::new(Ipv4Addr::new(239, 24, 9, 13), 5000), 7 * 188))
        );
        assert_eq!(udp_payload(&frame[..30]), None);

        let mut tcp = frame.clone();
        tcp[14 + 9] = 6;
        assert_eq!(udp_payload(&tcp), None);
    }

    #[test]
    fn test_payload_counters_accumulate() {
        let stats = SinkStats::default();
        let a = SocketAddrV4::new(Ipv4Addr::new(239, 24, 9, 14), 5000);
        let b = SocketAddrV4::new(Ipv4Addr::new(239, 24, 9, 13), 5000);

        stats.add_payload(&HashMap::from([(a, 1316), (b, 188)]));
        stats.add_payload(&HashMap::from([(a, 1316)]));
        stats.add_payload(&HashMap::new());

        assert_eq!(stats.payload_by_group(), vec![(b, 188), (a, 2632)]);
    }

    #[test]
    fn test_kernel_struct_layout() {
        assert_eq!(std::mem::size_of::<XdpUmemReg>(), 32);
        assert_eq!(std::mem::size_of::<XdpDesc>(), 16);
        assert_eq!(std::mem::size_of::<SockaddrXdp>(), 16);
        assert_eq!(std::mem::size_of::<XdpRingOffset>(), 32);
        assert_eq!(std::mem::size_of::<XdpMmapOffsets>(), 128);
    }
}
