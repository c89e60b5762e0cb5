//! Redirect decision engine.
//!
//! One call per packet, no state carried between packets:
//!
//! 1. Queue not bound → pass, before touching the packet.
//! 2. Parse Ethernet → IPv4 → UDP; anything else or any parse failure → pass.
//! 3. Destination port rejected by the filter → pass.
//! 4. Look up the bound consumer; redirect to it, or pass if none is published.

use crate::cursor::{HeaderCursor, PacketBytes, ParseError};
use crate::parse::{parse_ethernet, parse_ipv4, parse_udp};
use crate::{ETH_P_IP, IPPROTO_UDP, MAX_QUEUES};

/// Per-queue "consumer bound" flags, written by the control plane.
pub trait QueueBindings {
    fn is_bound(&self, queue: u32) -> bool;
}

/// Destination-port filter.
pub trait PortFilter {
    fn matches(&self, dst_port: u16) -> bool;
}

/// Per-queue consumer handles, written by the control plane.
pub trait RedirectTargets {
    type Handle;

    /// The consumer published for `queue`, if any.
    fn target(&self, queue: u32) -> Option<Self::Handle>;
}

/// Why a packet was left to normal processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassReason {
    /// No consumer bound to the receive queue (or queue out of range).
    Unbound,
    NotIpv4,
    NotUdp,
    /// A header ran past the end of the buffer.
    Truncated,
    /// A header length field was inconsistent.
    Malformed,
    /// Destination port not in the configured filter.
    PortFiltered,
    /// Queue marked bound but no consumer handle published yet.
    NoTarget,
}

impl PassReason {
    /// Stable snake_case label, used in metrics and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            PassReason::Unbound => "unbound",
            PassReason::NotIpv4 => "not_ipv4",
            PassReason::NotUdp => "not_udp",
            PassReason::Truncated => "truncated",
            PassReason::Malformed => "malformed",
            PassReason::PortFiltered => "port_filtered",
            PassReason::NoTarget => "no_target",
        }
    }
}

impl From<ParseError> for PassReason {
    #[inline(always)]
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InsufficientData => PassReason::Truncated,
            ParseError::MalformedHeader => PassReason::Malformed,
        }
    }
}

/// Classification result handed back to the receive path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome<H> {
    Pass(PassReason),
    Redirect(H),
}

impl<H> Outcome<H> {
    pub fn is_redirect(&self) -> bool {
        matches!(self, Outcome::Redirect(_))
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass(_))
    }

    pub fn pass_reason(&self) -> Option<PassReason> {
        match self {
            Outcome::Pass(reason) => Some(*reason),
            Outcome::Redirect(_) => None,
        }
    }
}

/// Walk Ethernet → IPv4 → UDP and return the UDP destination port.
#[inline(always)]
pub fn udp_destination<P: PacketBytes + ?Sized>(packet: &P) -> Result<u16, PassReason> {
    let mut cursor = HeaderCursor::new(packet);

    let eth = parse_ethernet(&mut cursor)?;
    if eth.ether_type != ETH_P_IP {
        return Err(PassReason::NotIpv4);
    }

    let ip = parse_ipv4(&mut cursor)?;
    if ip.protocol != IPPROTO_UDP {
        return Err(PassReason::NotUdp);
    }

    let udp = parse_udp(&mut cursor)?;
    Ok(udp.dst_port)
}

/// Decide whether `packet`, received on `queue`, goes to the bound consumer.
#[inline(always)]
pub fn classify<P, B, F, R>(
    packet: &P,
    queue: u32,
    bindings: &B,
    filter: &F,
    targets: &R,
) -> Outcome<R::Handle>
where
    P: PacketBytes + ?Sized,
    B: QueueBindings + ?Sized,
    F: PortFilter + ?Sized,
    R: RedirectTargets + ?Sized,
{
    if queue >= MAX_QUEUES || !bindings.is_bound(queue) {
        return Outcome::Pass(PassReason::Unbound);
    }

    let dst_port = match udp_destination(packet) {
        Ok(port) => port,
        Err(reason) => return Outcome::Pass(reason),
    };

    if !filter.matches(dst_port) {
        return Outcome::Pass(PassReason::PortFiltered);
    }

    match targets.target(queue) {
        Some(handle) => Outcome::Redirect(handle),
        None => Outcome::Pass(PassReason::NoTarget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AnyPort, PortSet};
    use crate::frames::Frame;
    use crate::{ETH_HLEN, ETH_P_IPV6, IPPROTO_TCP, MIN_HEADER_LEN};

    /// One bound queue whose consumer handle is `queue + 100`.
    struct OneQueue {
        queue: u32,
        published: bool,
    }

    impl OneQueue {
        fn bound(queue: u32) -> Self {
            Self {
                queue,
                published: true,
            }
        }
    }

    impl QueueBindings for OneQueue {
        fn is_bound(&self, queue: u32) -> bool {
            queue == self.queue
        }
    }

    impl RedirectTargets for OneQueue {
        type Handle = u32;

        fn target(&self, queue: u32) -> Option<u32> {
            (self.published && queue == self.queue).then_some(queue + 100)
        }
    }

    /// Every queue bound, used to check range validation.
    struct AllBound;

    impl QueueBindings for AllBound {
        fn is_bound(&self, _queue: u32) -> bool {
            true
        }
    }

    impl RedirectTargets for AllBound {
        type Handle = u32;

        fn target(&self, queue: u32) -> Option<u32> {
            Some(queue)
        }
    }

    fn media_ports() -> PortSet {
        PortSet::new(&[5000, 5555, 5500, 2058]).unwrap()
    }

    fn run(pkt: &[u8], queue: u32, tables: &OneQueue, filter: &PortSet) -> Outcome<u32> {
        classify(pkt, queue, tables, filter, tables)
    }

    #[test]
    fn test_unbound_queue_passes_any_payload() {
        let tables = OneQueue::bound(0);
        let filter = PortSet::any();
        for pkt in [
            Frame::udp(5000).build(),
            Frame::udp(1).protocol(IPPROTO_TCP).build(),
            vec![0xff; 3],
            Vec::new(),
        ] {
            assert_eq!(
                run(&pkt, 1, &tables, &filter),
                Outcome::Pass(PassReason::Unbound)
            );
        }
    }

    #[test]
    fn test_queue_out_of_range_is_unbound() {
        let pkt = Frame::udp(5000).build();
        assert_eq!(
            classify(&pkt[..], MAX_QUEUES, &AllBound, &AnyPort, &AllBound),
            Outcome::Pass(PassReason::Unbound)
        );
        assert_eq!(
            classify(&pkt[..], MAX_QUEUES - 1, &AllBound, &AnyPort, &AllBound),
            Outcome::Redirect(MAX_QUEUES - 1)
        );
    }

    #[test]
    fn test_shorter_than_ethernet_passes() {
        let tables = OneQueue::bound(0);
        for len in 0..ETH_HLEN {
            let pkt = vec![0u8; len];
            assert_eq!(
                run(&pkt, 0, &tables, &PortSet::any()),
                Outcome::Pass(PassReason::Truncated)
            );
        }
    }

    #[test]
    fn test_non_ipv4_passes() {
        let tables = OneQueue::bound(0);
        let pkt = Frame::udp(5000).ether_type(ETH_P_IPV6).build();
        assert_eq!(
            run(&pkt, 0, &tables, &PortSet::any()),
            Outcome::Pass(PassReason::NotIpv4)
        );

        let arp = Frame::udp(5000).ether_type(0x0806).build();
        assert_eq!(
            run(&arp, 0, &tables, &PortSet::any()),
            Outcome::Pass(PassReason::NotIpv4)
        );
    }

    #[test]
    fn test_ipv4_ethertype_decides_not_version_nibble() {
        let tables = OneQueue::bound(0);
        let mut pkt = Frame::udp(5000).build();
        pkt[ETH_HLEN] = 0x65;
        assert_eq!(run(&pkt, 0, &tables, &PortSet::any()), Outcome::Redirect(100));
    }

    #[test]
    fn test_ipv4_non_udp_passes() {
        let tables = OneQueue::bound(0);
        let pkt = Frame::udp(5000).protocol(IPPROTO_TCP).build();
        assert_eq!(
            run(&pkt, 0, &tables, &PortSet::any()),
            Outcome::Pass(PassReason::NotUdp)
        );
    }

    #[test]
    fn test_empty_filter_redirects_any_udp() {
        let tables = OneQueue::bound(3);
        for port in [1, 53, 5000, 6000, u16::MAX] {
            let pkt = Frame::udp(port).payload(&[0x47; 188]).build();
            assert_eq!(run(&pkt, 3, &tables, &PortSet::any()), Outcome::Redirect(103));
        }
    }

    #[test]
    fn test_port_filter() {
        let tables = OneQueue::bound(0);
        let filter = media_ports();

        let pkt = Frame::udp(5000).build();
        assert_eq!(run(&pkt, 0, &tables, &filter), Outcome::Redirect(100));

        let pkt = Frame::udp(6000).build();
        assert_eq!(
            run(&pkt, 0, &tables, &filter),
            Outcome::Pass(PassReason::PortFiltered)
        );
    }

    #[test]
    fn test_malformed_ihl_passes() {
        let tables = OneQueue::bound(0);
        let pkt = Frame::udp(5000).ihl(4).build();
        assert_eq!(
            run(&pkt, 0, &tables, &PortSet::any()),
            Outcome::Pass(PassReason::Malformed)
        );
    }

    #[test]
    fn test_minimum_length_boundary() {
        let tables = OneQueue::bound(0);
        let filter = media_ports();
        let pkt = Frame::udp(5000).build();
        assert_eq!(pkt.len(), MIN_HEADER_LEN);

        assert_eq!(run(&pkt, 0, &tables, &filter), Outcome::Redirect(100));
        assert_eq!(
            run(&pkt[..MIN_HEADER_LEN - 1], 0, &tables, &filter),
            Outcome::Pass(PassReason::Truncated)
        );
    }

    #[test]
    fn test_every_truncation_passes() {
        let tables = OneQueue::bound(0);
        let pkt = Frame::udp(5000).ihl(6).vlan(7).build();
        for len in 0..pkt.len() {
            assert!(run(&pkt[..len], 0, &tables, &PortSet::any()).is_pass());
        }
        assert!(run(&pkt, 0, &tables, &PortSet::any()).is_redirect());
    }

    #[test]
    fn test_bound_without_published_target_passes() {
        let tables = OneQueue {
            queue: 0,
            published: false,
        };
        let pkt = Frame::udp(5000).build();
        assert_eq!(
            run(&pkt, 0, &tables, &PortSet::any()),
            Outcome::Pass(PassReason::NoTarget)
        );
    }

    #[test]
    fn test_vlan_tagged_udp_redirects() {
        let tables = OneQueue::bound(0);
        let pkt = Frame::udp(5555).vlan(42).build();
        assert_eq!(run(&pkt, 0, &tables, &media_ports()), Outcome::Redirect(100));
    }

    #[test]
    fn test_outcome_helpers() {
        let pass: Outcome<u32> = Outcome::Pass(PassReason::NotUdp);
        assert!(pass.is_pass());
        assert_eq!(pass.pass_reason(), Some(PassReason::NotUdp));

        let redirect = Outcome::Redirect(1u32);
        assert!(redirect.is_redirect());
        assert_eq!(redirect.pass_reason(), None);
    }
}
