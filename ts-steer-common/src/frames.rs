//! Test frame builder for Ethernet/IPv4/UDP packets.

use crate::{ETH_P_8021Q, ETH_P_IP, IPPROTO_UDP, IP_HLEN, UDP_HLEN};

pub(crate) struct Frame {
    vlans: Vec<u16>,
    ether_type: u16,
    ihl: u8,
    options_len: Option<usize>,
    protocol: u8,
    dst_port: u16,
    udp_length: Option<u16>,
    payload: Vec<u8>,
}

impl Frame {
    /// A well-formed UDP/IPv4 frame to `dst_port` with no payload.
    pub(crate) fn udp(dst_port: u16) -> Self {
        Self {
            vlans: Vec::new(),
            ether_type: ETH_P_IP,
            ihl: 5,
            options_len: None,
            protocol: IPPROTO_UDP,
            dst_port,
            udp_length: None,
            payload: Vec::new(),
        }
    }

    pub(crate) fn vlan(mut self, tci: u16) -> Self {
        self.vlans.push(tci);
        self
    }

    pub(crate) fn ether_type(mut self, ether_type: u16) -> Self {
        self.ether_type = ether_type;
        self
    }

    pub(crate) fn ihl(mut self, ihl: u8) -> Self {
        self.ihl = ihl;
        self
    }

    /// Override the number of option bytes written (defaults to what IHL declares).
    pub(crate) fn options_len(mut self, len: usize) -> Self {
        self.options_len = Some(len);
        self
    }

    pub(crate) fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub(crate) fn udp_length(mut self, length: u16) -> Self {
        self.udp_length = Some(length);
        self
    }

    pub(crate) fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let mut pkt = Vec::new();

        // Ethernet: multicast MAC for 239.24.9.13, locally administered source.
        pkt.extend_from_slice(&[0x01, 0x00, 0x5e, 0x18, 0x09, 0x0d]);
        pkt.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        for tci in &self.vlans {
            pkt.extend_from_slice(&ETH_P_8021Q.to_be_bytes());
            pkt.extend_from_slice(&tci.to_be_bytes());
        }
        pkt.extend_from_slice(&self.ether_type.to_be_bytes());

        let options_len = self
            .options_len
            .unwrap_or_else(|| (self.ihl as usize * 4).saturating_sub(IP_HLEN));
        let udp_len = UDP_HLEN + self.payload.len();
        let total_len = (IP_HLEN + options_len + udp_len) as u16;

        pkt.push(0x40 | (self.ihl & 0x0F));
        pkt.push(0);
        pkt.extend_from_slice(&total_len.to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0x40, 0]);
        pkt.push(64);
        pkt.push(self.protocol);
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(&[10, 0, 0, 1]);
        pkt.extend_from_slice(&[239, 24, 9, 13]);
        pkt.extend(std::iter::repeat(0u8).take(options_len));

        let length = self.udp_length.unwrap_or(udp_len as u16);
        pkt.extend_from_slice(&40000u16.to_be_bytes());
        pkt.extend_from_slice(&self.dst_port.to_be_bytes());
        pkt.extend_from_slice(&length.to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(&self.payload);

        pkt
    }
}
