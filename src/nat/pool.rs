//! Free-address pool for sub-host NAT

use crate::error::{RouterError, RouterResult};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Largest range accepted from an uplink (a /16)
const MAX_POOL_SIZE: u32 = 65536;

/// Set of NAT addresses not currently bound to a client.
///
/// A pool only exists while a NAT-capable uplink is up. It is dropped as a
/// whole on uplink loss and rebuilt from the range on the next uplink.
#[derive(Debug, Clone)]
pub struct AddressPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
    free: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// Build a pool holding every address in the inclusive range
    pub fn materialize(start: Ipv4Addr, end: Ipv4Addr) -> RouterResult<Self> {
        let (first, last) = (u32::from(start), u32::from(end));
        if first > last {
            return Err(RouterError::InvalidParameter(format!(
                "Invalid NAT address range {} - {}",
                start, end
            )));
        }
        if last - first >= MAX_POOL_SIZE {
            return Err(RouterError::InvalidParameter(format!(
                "NAT address range {} - {} exceeds {} addresses",
                start, end, MAX_POOL_SIZE
            )));
        }

        Ok(Self {
            start,
            end,
            free: (first..=last).map(Ipv4Addr::from).collect(),
        })
    }

    /// Remove and return one free address
    pub fn take(&mut self) -> RouterResult<Ipv4Addr> {
        self.free.pop_first().ok_or_else(|| {
            RouterError::PoolExhausted(format!("No free NAT address in {} - {}", self.start, self.end))
        })
    }

    /// Return an address to the free set. Addresses outside the range are ignored.
    pub fn give_back(&mut self, addr: Ipv4Addr) {
        if self.contains_in_range(addr) {
            self.free.insert(addr);
        }
    }

    pub fn size(&self) -> usize {
        self.free.len()
    }

    pub fn is_free(&self, addr: Ipv4Addr) -> bool {
        self.free.contains(&addr)
    }

    pub fn range(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.start, self.end)
    }

    fn contains_in_range(&self, addr: Ipv4Addr) -> bool {
        (u32::from(self.start)..=u32::from(self.end)).contains(&u32::from(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_materialize_inclusive() {
        let pool = AddressPool::materialize(ip("10.0.0.1"), ip("10.0.0.3")).unwrap();
        assert_eq!(pool.size(), 3);
        assert!(pool.is_free(ip("10.0.0.1")));
        assert!(pool.is_free(ip("10.0.0.3")));
        assert!(!pool.is_free(ip("10.0.0.4")));

        let single = AddressPool::materialize(ip("10.0.0.9"), ip("10.0.0.9")).unwrap();
        assert_eq!(single.size(), 1);
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert!(AddressPool::materialize(ip("10.0.0.5"), ip("10.0.0.1")).is_err());
        assert!(AddressPool::materialize(ip("10.0.0.0"), ip("10.2.0.0")).is_err());
    }

    #[test]
    fn test_take_and_give_back() {
        let mut pool = AddressPool::materialize(ip("10.0.0.1"), ip("10.0.0.2")).unwrap();
        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert_ne!(a, b);
        assert!(matches!(pool.take(), Err(RouterError::PoolExhausted(_))));

        pool.give_back(a);
        assert_eq!(pool.take().unwrap(), a);

        pool.give_back(ip("192.0.2.1"));
        assert_eq!(pool.size(), 0);
    }
}
