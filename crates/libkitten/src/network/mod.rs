//! Host network fabric.
//!
//! Everything the runtime touches on the host side of container
//! networking: bridge links, veth pairs, iptables NAT and port-forward
//! rules, and the per-subnet address allocator. Link, address and route
//! work goes through a raw rtnetlink socket ([`netlink`]); only
//! iptables is driven through its binary.

pub mod bridge;
pub mod firewall;
pub mod ipalloc;
pub mod netlink;
pub mod netns;
pub mod veth;

use thiserror::Error;

pub use bridge::{create_bridge, delete_bridge};
pub use firewall::{add_port_forward, remove_port_forward};
pub use ipalloc::{allocate_ip, release_ip};
pub use netlink::NetlinkHandle;
pub use veth::{
    assign_container_address, configure_host_veth, create_veth_pair, delete_veth,
    move_veth_to_namespace, rename_container_veth,
};

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("netlink request failed: {0}")]
    Netlink(#[source] std::io::Error),
    #[error("interface not found: {0}")]
    LinkNotFound(String),
    #[error("invalid interface name: {0}")]
    InvalidName(String),
    #[error("bridge error: {0}")]
    Bridge(String),
    #[error("firewall error: {0}")]
    Firewall(String),
    #[error("address allocation error: {0}")]
    AddressAllocation(String),
    #[error("failed to enter network namespace")]
    Netns(#[source] nix::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// The netlink-level equivalent of an `ip`/`iptables` "File exists"
    /// diagnostic; callers treating re-creation as success check this.
    pub fn already_exists(&self) -> bool {
        matches!(self, NetError::Netlink(err) if err.raw_os_error() == Some(libc::EEXIST))
    }

    /// The equivalent of "Cannot find device": the link is already
    /// gone, which cleanup paths treat as success.
    pub fn link_gone(&self) -> bool {
        match self {
            NetError::LinkNotFound(_) => true,
            NetError::Netlink(err) => {
                matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENOENT))
            }
            _ => false,
        }
    }
}
