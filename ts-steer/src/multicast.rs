//! Multicast group membership.
//!
//! The XDP program only sees what the NIC delivers, so the daemon joins the
//! configured groups on the capture interface (IGMP / MLD). The membership
//! sockets never receive anything: matching frames are redirected before
//! they reach the stack. Dropping [`GroupMembership`] leaves the groups.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use tracing::info;

/// Sockets holding the joined groups open.
pub struct GroupMembership {
    v4: Option<Socket>,
    v6: Option<Socket>,
    joined: usize,
}

impl GroupMembership {
    pub fn len(&self) -> usize {
        self.joined
    }

    pub fn is_empty(&self) -> bool {
        self.joined == 0
    }

    /// Leave every group now instead of at drop.
    pub fn leave(self) {
        if self.is_empty() {
            return;
        }
        let joined = self.joined;
        drop(self.v4);
        drop(self.v6);
        info!(groups = joined, "left multicast groups");
    }
}

/// Join every group in `groups` on the interface with index `ifindex`.
pub fn join_groups(ifindex: u32, groups: &[IpAddr]) -> Result<GroupMembership> {
    let (v4_groups, v6_groups) = split_groups(groups);

    let v4 = if v4_groups.is_empty() {
        None
    } else {
        let socket = udp_socket(Domain::IPV4)?;
        let interface = InterfaceIndexOrAddress::Index(ifindex);
        for group in &v4_groups {
            socket
                .join_multicast_v4_n(group, &interface)
                .with_context(|| format!("joining multicast group {}", group))?;
            info!(group = %group, ifindex, "joined IPv4 multicast group");
        }
        Some(socket)
    };

    let v6 = if v6_groups.is_empty() {
        None
    } else {
        let socket = udp_socket(Domain::IPV6)?;
        for group in &v6_groups {
            socket
                .join_multicast_v6(group, ifindex)
                .with_context(|| format!("joining multicast group {}", group))?;
            info!(group = %group, ifindex, "joined IPv6 multicast group");
        }
        Some(socket)
    };

    Ok(GroupMembership {
        v4,
        v6,
        joined: v4_groups.len() + v6_groups.len(),
    })
}

fn udp_socket(domain: Domain) -> Result<Socket> {
    Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating membership socket")
}

/// Split by family, dropping repeats.
fn split_groups(groups: &[IpAddr]) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for group in groups {
        match group {
            IpAddr::V4(addr) if !v4.contains(addr) => v4.push(*addr),
            IpAddr::V6(addr) if !v6.contains(addr) => v6.push(*addr),
            _ => {}
        }
    }
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_groups_by_family() {
        let groups: Vec<IpAddr> = vec![
            "239.24.9.13".parse().unwrap(),
            "ff3e::1234".parse().unwrap(),
            "239.24.9.14".parse().unwrap(),
            "239.24.9.13".parse().unwrap(),
        ];
        let (v4, v6) = split_groups(&groups);
        assert_eq!(
            v4,
            vec![Ipv4Addr::new(239, 24, 9, 13), Ipv4Addr::new(239, 24, 9, 14)]
        );
        assert_eq!(v6, vec!["ff3e::1234".parse::<Ipv6Addr>().unwrap()]);
    }

    #[test]
    fn test_no_groups_opens_no_sockets() {
        let membership = join_groups(1, &[]).unwrap();
        assert!(membership.is_empty());
        assert!(membership.v4.is_none());
        assert!(membership.v6.is_none());
        membership.leave();
    }
}
