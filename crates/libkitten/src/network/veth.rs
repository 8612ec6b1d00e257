//! Veth pair management.
//!
//! Each Net-enabled container gets a veth pair: the host end
//! (`veth<short-id>`) stays behind and is attached to the bridge, the
//! peer (`vethc<short-id>`) is moved into the container's network
//! namespace and renamed to `eth0` there. The peer is reaped by the
//! kernel together with the namespace; only the host end needs explicit
//! cleanup.

use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;

use ipnetwork::Ipv4Network;

use super::netlink::NetlinkHandle;
use super::{netns, NetError, Result};
use crate::config::{NetworkConfig, NetworkMode};
use crate::utils::short_id;

/// Name of the container-side interface after the rename.
pub const CONTAINER_IFNAME: &str = "eth0";

/// Creates the veth pair for a container and returns
/// `(host_name, peer_name)`. Both names stay within the kernel's
/// 15-byte interface-name limit.
pub fn create_veth_pair(container_id: &str) -> Result<(String, String)> {
    let host = format!("veth{}", short_id(container_id));
    let peer = format!("vethc{}", short_id(container_id));

    let mut netlink = NetlinkHandle::new()?;
    netlink.create_veth(&host, &peer)?;

    tracing::debug!(%host, %peer, "created veth pair");
    Ok((host, peer))
}

/// Moves the peer end into the network namespace of `pid` by fd.
pub fn move_veth_to_namespace(peer: &str, pid: i32) -> Result<()> {
    let mut netlink = NetlinkHandle::new()?;
    let ifindex = netlink.get_ifindex(peer)?;
    let ns_fd = netns::open_netns(pid)?;
    netlink.set_link_netns(ifindex, ns_fd.as_raw_fd())?;

    tracing::debug!(peer, pid, "moved veth into container netns");
    Ok(())
}

/// Inside the namespace of `pid`: renames the moved peer to `eth0` and
/// brings it up.
pub fn rename_container_veth(pid: i32, peer: &str) -> Result<()> {
    let peer = peer.to_string();
    netns::with_netns(pid, move || {
        let mut netlink = NetlinkHandle::new()?;
        let ifindex = netlink.get_ifindex(&peer)?;
        netlink.rename_link(ifindex, CONTAINER_IFNAME)?;
        netlink.set_link_state(ifindex, true)?;
        Ok(())
    })?;

    tracing::debug!(pid, "renamed container veth to eth0");
    Ok(())
}

/// Inside the namespace of `pid`: assigns the container address and the
/// default route. The child performs the same step on its own; whoever
/// loses the race sees `EEXIST`, which counts as success.
pub fn assign_container_address(
    pid: i32,
    addr: Ipv4Network,
    gateway: Ipv4Addr,
) -> Result<()> {
    netns::with_netns(pid, move || {
        let mut netlink = NetlinkHandle::new()?;
        let ifindex = netlink.get_ifindex(CONTAINER_IFNAME)?;
        match netlink.add_address(ifindex, addr) {
            Err(err) if !err.already_exists() => return Err(err),
            _ => {}
        }
        match netlink.add_default_route(gateway) {
            Err(err) if !err.already_exists() => return Err(err),
            _ => {}
        }
        Ok(())
    })
}

/// Brings the host end up and wires it to its network: in bridge mode
/// it is attached to the named bridge (which is ensured to carry the
/// gateway address and be up), otherwise the gateway address goes onto
/// the veth itself.
pub fn configure_host_veth(host: &str, config: &NetworkConfig) -> Result<()> {
    let mut netlink = NetlinkHandle::new()?;
    let ifindex = netlink.get_ifindex(host)?;
    netlink.set_link_state(ifindex, true)?;

    let prefix = config.subnet.map(|s| s.prefix()).unwrap_or(24);
    let gateway = config
        .gateway
        .ok_or_else(|| NetError::Bridge("network has no gateway address".to_string()))?;
    let gateway_net = Ipv4Network::new(gateway, prefix)
        .map_err(|err| NetError::Bridge(err.to_string()))?;

    if config.mode == NetworkMode::Bridge {
        let bridge_ifindex = netlink
            .get_ifindex(&config.bridge_name)
            .map_err(|_| NetError::Bridge(format!("bridge does not exist: {}", config.bridge_name)))?;
        netlink.set_link_master(ifindex, bridge_ifindex)?;

        match netlink.add_address(bridge_ifindex, gateway_net) {
            Err(err) if !err.already_exists() => return Err(err),
            _ => {}
        }
        netlink.set_link_state(bridge_ifindex, true)?;
        tracing::debug!(host, bridge = %config.bridge_name, "attached host veth to bridge");
    } else {
        netlink.add_address(ifindex, gateway_net)?;
        tracing::debug!(host, gateway = %gateway, "assigned gateway address to host veth");
    }

    Ok(())
}

/// Deletes the host end of a pair. A link that is already gone counts
/// as deleted.
pub fn delete_veth(name: &str) -> Result<()> {
    let mut netlink = NetlinkHandle::new()?;
    let ifindex = match netlink.get_ifindex(name) {
        Ok(ifindex) => ifindex,
        Err(err) if err.link_gone() => return Ok(()),
        Err(err) => return Err(err),
    };
    match netlink.delete_link(ifindex) {
        Err(err) if !err.link_gone() => Err(err),
        _ => Ok(()),
    }
}
