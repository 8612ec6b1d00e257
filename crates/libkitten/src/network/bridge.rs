//! Bridge lifecycle with reference counting.
//!
//! Bridges are global host resources shared by every deployment that
//! names them, so creation and deletion go through a process-wide
//! refcount registry: `create_bridge` is idempotent and increments,
//! `delete_bridge` decrements and only tears the link and its NAT rules
//! down when the last user is gone.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use once_cell::sync::Lazy;

use super::netlink::NetlinkHandle;
use super::{firewall, NetError, Result};

/// Subnet containers fall back to when their network declares none.
pub const DEFAULT_BRIDGE_SUBNET: &str = "10.0.0.0/24";

static BRIDGES: Lazy<Mutex<HashMap<String, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Creates a bridge link, assigns the gateway address, brings it up,
/// enables IPv4 forwarding and installs the NAT scaffolding.
/// Idempotent: a bridge that already exists (created here or out of
/// band) just gains a reference.
pub fn create_bridge(
    name: &str,
    subnet: Option<Ipv4Network>,
    gateway: Option<Ipv4Addr>,
) -> Result<()> {
    let mut bridges = BRIDGES.lock().expect("bridge registry poisoned");

    if let Some(refs) = bridges.get_mut(name) {
        *refs += 1;
        tracing::debug!(bridge = name, refs = *refs, "bridge already referenced");
        return Ok(());
    }

    let mut netlink = NetlinkHandle::new()?;
    if !netlink.link_exists(name) {
        netlink
            .create_bridge(name)
            .map_err(|err| NetError::Bridge(format!("failed to create {name}: {err}")))?;
        tracing::info!(bridge = name, "created bridge");
    }

    let ifindex = netlink.get_ifindex(name)?;

    if let Some(gateway) = gateway {
        let prefix = subnet.map(|s| s.prefix()).unwrap_or(24);
        let addr = Ipv4Network::new(gateway, prefix)
            .map_err(|err| NetError::Bridge(err.to_string()))?;
        match netlink.add_address(ifindex, addr) {
            Err(err) if !err.already_exists() => return Err(err),
            _ => {}
        }
    }

    netlink.set_link_state(ifindex, true)?;

    if let Err(err) = enable_ip_forward() {
        tracing::warn!(?err, "failed to enable net.ipv4.ip_forward");
    }

    firewall::setup_bridge_nat(name)?;

    bridges.insert(name.to_string(), 1);
    Ok(())
}

/// Drops one reference to a bridge; the last reference sets the link
/// down, deletes it (a link that is already gone counts as deleted) and
/// removes the NAT scaffolding. Teardown errors are swallowed.
pub fn delete_bridge(name: &str) -> Result<()> {
    let mut bridges = BRIDGES.lock().expect("bridge registry poisoned");

    match bridges.get_mut(name) {
        Some(refs) if *refs > 1 => {
            *refs -= 1;
            tracing::debug!(bridge = name, refs = *refs, "bridge still referenced");
            return Ok(());
        }
        Some(_) => {}
        // never created through the registry; nothing to tear down
        None => return Ok(()),
    }
    bridges.remove(name);

    let mut netlink = NetlinkHandle::new()?;
    match netlink.get_ifindex(name) {
        Ok(ifindex) => {
            let _ = netlink.set_link_state(ifindex, false);
            match netlink.delete_link(ifindex) {
                Err(err) if !err.link_gone() => {
                    tracing::warn!(bridge = name, ?err, "failed to delete bridge link");
                }
                _ => {}
            }
        }
        Err(err) if err.link_gone() => {}
        Err(err) => tracing::warn!(bridge = name, ?err, "failed to look up bridge"),
    }

    firewall::cleanup_bridge_nat(name);
    tracing::info!(bridge = name, "deleted bridge");
    Ok(())
}

fn enable_ip_forward() -> std::io::Result<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::geteuid;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_delete_unknown_bridge_is_noop() {
        assert!(delete_bridge("kitten-unknown0").is_ok());
    }

    #[test]
    #[serial]
    fn test_bridge_refcount_lifecycle() {
        if !geteuid().is_root() {
            eprintln!("skipping test: requires root privileges");
            return;
        }

        let subnet: Ipv4Network = "10.99.0.0/24".parse().unwrap();
        let gateway: Ipv4Addr = "10.99.0.1".parse().unwrap();

        create_bridge("kittentest0", Some(subnet), Some(gateway)).unwrap();
        // second creation with identical arguments only bumps the count
        create_bridge("kittentest0", Some(subnet), Some(gateway)).unwrap();

        let netlink = NetlinkHandle::new().unwrap();
        assert!(netlink.link_exists("kittentest0"));

        delete_bridge("kittentest0").unwrap();
        assert!(netlink.link_exists("kittentest0"));

        delete_bridge("kittentest0").unwrap();
        assert!(!netlink.link_exists("kittentest0"));
    }
}
