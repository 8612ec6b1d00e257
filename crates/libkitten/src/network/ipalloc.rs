//! Per-subnet IPv4 address allocation.
//!
//! A process-wide registry of free-lists, one per subnet. Addresses are
//! handed out lowest-first starting at the second host address, so the
//! network address, the conventional gateway (`.1`) and the broadcast
//! address are never allocated; an explicitly requested static address
//! is honored and reserved. Containers return their address on cleanup.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use once_cell::sync::Lazy;

use super::{NetError, Result};

static POOLS: Lazy<Mutex<HashMap<Ipv4Network, HashSet<Ipv4Addr>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Allocates an address in `subnet`, skipping the network address, the
/// broadcast address, the gateway and everything already handed out.
/// `requested` pins a static address instead of scanning.
pub fn allocate_ip(
    subnet: Ipv4Network,
    gateway: Option<Ipv4Addr>,
    requested: Option<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let mut pools = POOLS.lock().expect("ip allocator poisoned");
    let used = pools.entry(subnet).or_default();

    if let Some(addr) = requested {
        if !subnet.contains(addr) {
            return Err(NetError::AddressAllocation(format!(
                "{addr} is not in subnet {subnet}"
            )));
        }
        if addr == subnet.network()
            || addr == subnet.broadcast()
            || Some(addr) == gateway
        {
            return Err(NetError::AddressAllocation(format!(
                "{addr} is reserved in subnet {subnet}"
            )));
        }
        if !used.insert(addr) {
            return Err(NetError::AddressAllocation(format!(
                "{addr} is already allocated"
            )));
        }
        return Ok(addr);
    }

    // Host addresses run from index 1 (usually the gateway) to size-2;
    // allocation starts at index 2 so the first host address is never
    // handed out.
    let size = subnet.size();
    for n in 2..size.saturating_sub(1) {
        let Some(addr) = subnet.nth(n) else { break };
        if Some(addr) == gateway || used.contains(&addr) {
            continue;
        }
        used.insert(addr);
        return Ok(addr);
    }

    Err(NetError::AddressAllocation(format!(
        "subnet {subnet} is exhausted"
    )))
}

/// Returns an address to its subnet's pool.
pub fn release_ip(subnet: Ipv4Network, addr: Ipv4Addr) {
    let mut pools = POOLS.lock().expect("ip allocator poisoned");
    if let Some(used) = pools.get_mut(&subnet) {
        used.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_allocate_sequential() -> Result<()> {
        let subnet: Ipv4Network = "10.11.0.0/24".parse()?;
        let gateway: Ipv4Addr = "10.11.0.1".parse()?;

        let first = allocate_ip(subnet, Some(gateway), None)?;
        let second = allocate_ip(subnet, Some(gateway), None)?;
        assert_eq!(first, "10.11.0.2".parse::<Ipv4Addr>()?);
        assert_eq!(second, "10.11.0.3".parse::<Ipv4Addr>()?);
        Ok(())
    }

    #[test]
    fn test_allocate_skips_reserved() -> Result<()> {
        let subnet: Ipv4Network = "10.12.0.0/24".parse()?;
        let gateway: Ipv4Addr = "10.12.0.2".parse()?;

        // the gateway sits inside the scan range and must be skipped
        let addr = allocate_ip(subnet, Some(gateway), None)?;
        assert_eq!(addr, "10.12.0.3".parse::<Ipv4Addr>()?);

        assert_ne!(addr, subnet.network());
        assert_ne!(addr, subnet.broadcast());
        assert!(subnet.contains(addr));
        assert!((2..=254).contains(&addr.octets()[3]));
        Ok(())
    }

    #[test]
    fn test_allocate_static() -> Result<()> {
        let subnet: Ipv4Network = "10.13.0.0/24".parse()?;
        let gateway: Ipv4Addr = "10.13.0.1".parse()?;
        let wanted: Ipv4Addr = "10.13.0.40".parse()?;

        assert_eq!(allocate_ip(subnet, Some(gateway), Some(wanted))?, wanted);
        // double allocation of the same static address fails
        assert!(allocate_ip(subnet, Some(gateway), Some(wanted)).is_err());
        // the gateway itself is never assignable
        assert!(allocate_ip(subnet, Some(gateway), Some(gateway)).is_err());
        // nor an address outside the subnet
        assert!(allocate_ip(subnet, Some(gateway), Some("192.168.1.5".parse()?)).is_err());
        Ok(())
    }

    #[test]
    fn test_release_recycles() -> Result<()> {
        let subnet: Ipv4Network = "10.14.0.0/24".parse()?;
        let addr = allocate_ip(subnet, None, None)?;
        let next = allocate_ip(subnet, None, None)?;
        assert_ne!(addr, next);

        release_ip(subnet, addr);
        assert_eq!(allocate_ip(subnet, None, None)?, addr);
        Ok(())
    }

    #[test]
    fn test_exhaustion() -> Result<()> {
        // a /30 has exactly one allocatable address at index 2
        let subnet: Ipv4Network = "10.15.0.0/30".parse()?;
        let only = allocate_ip(subnet, None, None)?;
        assert_eq!(only, "10.15.0.2".parse::<Ipv4Addr>()?);
        assert!(allocate_ip(subnet, None, None).is_err());
        Ok(())
    }
}
