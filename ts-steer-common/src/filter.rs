//! Destination-port filter.
//!
//! An empty set matches every port. Otherwise matching is exact membership,
//! no ranges or wildcards.

use core::fmt;

use crate::engine::PortFilter;
use crate::MAX_FILTER_PORTS;

const CAPACITY: usize = MAX_FILTER_PORTS as usize;

/// Filter that accepts every destination port.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyPort;

impl PortFilter for AnyPort {
    #[inline(always)]
    fn matches(&self, _dst_port: u16) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortSetError {
    /// More distinct ports than [`MAX_FILTER_PORTS`].
    TooManyPorts { max: usize },
}

impl fmt::Display for PortSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSetError::TooManyPorts { max } => {
                write!(f, "port filter holds at most {} distinct ports", max)
            }
        }
    }
}

/// Sorted, deduplicated, fixed-capacity set of UDP destination ports.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    ports: [u16; CAPACITY],
    len: usize,
}

impl Default for PortSet {
    fn default() -> Self {
        Self::any()
    }
}

impl PortSet {
    /// The empty set, which matches any port.
    pub const fn any() -> Self {
        Self {
            ports: [0; CAPACITY],
            len: 0,
        }
    }

    /// Build a set from `ports`, dropping duplicates.
    pub fn new(ports: &[u16]) -> Result<Self, PortSetError> {
        let mut set = Self::any();
        for &port in ports {
            set.insert(port)?;
        }
        Ok(set)
    }

    /// Insert a port. Returns `false` if it was already present.
    pub fn insert(&mut self, port: u16) -> Result<bool, PortSetError> {
        let idx = match self.as_slice().binary_search(&port) {
            Ok(_) => return Ok(false),
            Err(idx) => idx,
        };
        if self.len == CAPACITY {
            return Err(PortSetError::TooManyPorts { max: CAPACITY });
        }
        self.ports.copy_within(idx..self.len, idx + 1);
        self.ports[idx] = port;
        self.len += 1;
        Ok(true)
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.ports[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        self.as_slice().binary_search(&port).is_ok()
    }
}

impl PortFilter for PortSet {
    #[inline]
    fn matches(&self, dst_port: u16) -> bool {
        self.is_empty() || self.contains(dst_port)
    }
}

impl fmt::Debug for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.as_slice()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_matches_any_port() {
        let set = PortSet::any();
        assert!(set.is_empty());
        assert!(set.matches(0));
        assert!(set.matches(5000));
        assert!(set.matches(u16::MAX));
    }

    #[test]
    fn test_exact_membership() {
        let set = PortSet::new(&[5000, 5555, 5500, 2058]).unwrap();
        assert_eq!(set.as_slice(), &[2058, 5000, 5500, 5555]);
        assert!(set.matches(5000));
        assert!(set.matches(2058));
        assert!(!set.matches(6000));
        assert!(!set.matches(5001));
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut set = PortSet::new(&[5000, 5000, 2058]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(!set.insert(2058).unwrap());
        assert!(set.insert(1).unwrap());
        assert_eq!(set.as_slice(), &[1, 2058, 5000]);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let ports: Vec<u16> = (1..=CAPACITY as u16).collect();
        let mut set = PortSet::new(&ports).unwrap();
        assert_eq!(set.len(), CAPACITY);
        // Re-inserting an existing port is fine at capacity.
        assert!(!set.insert(1).unwrap());
        assert_eq!(
            set.insert(60000),
            Err(PortSetError::TooManyPorts { max: CAPACITY })
        );
    }

    #[test]
    fn test_any_port_filter() {
        assert!(AnyPort.matches(1));
        assert!(AnyPort.matches(6000));
    }
}
