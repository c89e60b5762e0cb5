//! Ethernet, IPv4 and UDP header parsers built on [`HeaderCursor`].
//!
//! Each parser checks the remaining length before reading, returns a view of
//! the fields the decision engine needs and leaves the cursor at the first
//! byte of the next header. Nothing is allocated or retained.

use crate::cursor::{HeaderCursor, PacketBytes, ParseError};
use crate::{ETH_HLEN, ETH_P_8021AD, ETH_P_8021Q, IP_HLEN, UDP_HLEN, VLAN_HLEN, VLAN_MAX_DEPTH};

/// Ethernet II header, with any VLAN tags already stripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    /// EtherType of the payload (the inner one when VLAN tags were present).
    pub ether_type: u16,
    /// Number of VLAN tags skipped.
    pub vlan_depth: u8,
}

/// Fixed part of an IPv4 header. Options are skipped, not exposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in 32-bit words (5..=15).
    pub ihl: u8,
    pub tos: u8,
    pub total_len: u16,
    pub protocol: u8,
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4Header {
    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }
}

/// UDP header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[inline(always)]
fn is_vlan(ether_type: u16) -> bool {
    ether_type == ETH_P_8021Q || ether_type == ETH_P_8021AD
}

/// Parse an Ethernet header and up to [`VLAN_MAX_DEPTH`] VLAN tags.
///
/// The reported `ether_type` is the next-protocol identifier.
#[inline(always)]
pub fn parse_ethernet<P: PacketBytes + ?Sized>(
    cursor: &mut HeaderCursor<'_, P>,
) -> Result<EthernetHeader, ParseError> {
    let h = cursor.take::<ETH_HLEN>()?;

    let mut ether_type = u16::from_be_bytes([h[12], h[13]]);
    let mut vlan_depth = 0u8;
    for _ in 0..VLAN_MAX_DEPTH {
        if !is_vlan(ether_type) {
            break;
        }
        // TCI (2 bytes) followed by the encapsulated EtherType.
        let tag = cursor.take::<VLAN_HLEN>()?;
        ether_type = u16::from_be_bytes([tag[2], tag[3]]);
        vlan_depth += 1;
    }

    Ok(EthernetHeader {
        dst: [h[0], h[1], h[2], h[3], h[4], h[5]],
        src: [h[6], h[7], h[8], h[9], h[10], h[11]],
        ether_type,
        vlan_depth,
    })
}

/// Parse an IPv4 header, options included.
///
/// The declared header length must be at least [`IP_HLEN`] and must fit in
/// the remaining bytes before the cursor moves.
#[inline(always)]
pub fn parse_ipv4<P: PacketBytes + ?Sized>(
    cursor: &mut HeaderCursor<'_, P>,
) -> Result<Ipv4Header, ParseError> {
    let h = cursor.peek::<IP_HLEN>()?;

    // The version nibble is not checked; the EtherType already said IPv4.
    let ihl = h[0] & 0x0F;
    let header_len = ihl as usize * 4;
    if header_len < IP_HLEN {
        return Err(ParseError::MalformedHeader);
    }
    if cursor.remaining() < header_len {
        return Err(ParseError::InsufficientData);
    }
    cursor.skip(header_len)?;

    Ok(Ipv4Header {
        ihl,
        tos: h[1],
        total_len: u16::from_be_bytes([h[2], h[3]]),
        protocol: h[9],
        src: [h[12], h[13], h[14], h[15]],
        dst: [h[16], h[17], h[18], h[19]],
    })
}

/// Parse a UDP header. A length field smaller than the header itself is
/// malformed.
#[inline(always)]
pub fn parse_udp<P: PacketBytes + ?Sized>(
    cursor: &mut HeaderCursor<'_, P>,
) -> Result<UdpHeader, ParseError> {
    let h = cursor.take::<UDP_HLEN>()?;

    let length = u16::from_be_bytes([h[4], h[5]]);
    if (length as usize) < UDP_HLEN {
        return Err(ParseError::MalformedHeader);
    }

    Ok(UdpHeader {
        src_port: u16::from_be_bytes([h[0], h[1]]),
        dst_port: u16::from_be_bytes([h[2], h[3]]),
        length,
        checksum: u16::from_be_bytes([h[6], h[7]]),
    })
}
