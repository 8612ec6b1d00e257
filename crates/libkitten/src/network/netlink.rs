//! Raw rtnetlink socket operations.
//!
//! A minimal route-netlink client covering exactly what the runtime
//! needs: creating bridge and veth links, moving a link into another
//! process's network namespace, renaming it there, assigning IPv4
//! addresses and installing routes. Every request is acknowledged, and
//! kernel errors surface with their errno so callers can tolerate
//! `EEXIST` (re-creation) and `ENODEV` (already gone).

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use ipnetwork::Ipv4Network;

use super::{NetError, Result};

const NETLINK_ROUTE: i32 = 0;

// Message types
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

// Request flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const IFF_UP: u32 = 0x1;

// Link attributes
const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;
const NLA_F_NESTED: u16 = 1 << 15;

// Address attributes
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

// Route attributes
const RTA_GATEWAY: u16 = 5;

// Route message constants
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // repr(C) plain-data structs only
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

/// Route-netlink socket handle.
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(NetError::Netlink(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = 0;
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetError::Netlink(err));
        }

        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Sends one request and consumes the kernel's acknowledgement,
    /// mapping a negative `nlmsgerr` code back to an `io::Error`.
    fn send_and_ack(&mut self, msg: &[u8]) -> Result<()> {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(NetError::Netlink(io::Error::last_os_error()));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(NetError::Netlink(io::Error::last_os_error()));
        }

        if len >= mem::size_of::<NlMsgHdr>() as isize {
            let hdr = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const NlMsgHdr) };
            if hdr.nlmsg_type == libc::NLMSG_ERROR as u16
                && len >= (mem::size_of::<NlMsgHdr>() + 4) as isize
            {
                let error_code = unsafe {
                    std::ptr::read_unaligned(
                        buf.as_ptr().add(mem::size_of::<NlMsgHdr>()) as *const i32
                    )
                };
                if error_code != 0 {
                    return Err(NetError::Netlink(io::Error::from_raw_os_error(-error_code)));
                }
            }
        }

        Ok(())
    }

    fn finish(&self, msg: &mut [u8], msg_type: u16, flags: u16, seq: u32) {
        let hdr = NlMsgHdr {
            nlmsg_len: msg.len() as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        msg[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));
    }

    /// Creates a bridge link and returns its interface index.
    pub fn create_bridge(&mut self, name: &str) -> Result<u32> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(128);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg::default()));

        add_attr_string(&mut msg, IFLA_IFNAME, name);
        let linkinfo = begin_nested(&mut msg, IFLA_LINKINFO);
        add_attr_string(&mut msg, IFLA_INFO_KIND, "bridge");
        end_nested(&mut msg, linkinfo);

        self.finish(
            &mut msg,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)?;
        self.get_ifindex(name)
    }

    /// Creates a veth pair in one request: the named link plus its peer,
    /// expressed as a nested `VETH_INFO_PEER` link message.
    pub fn create_veth(&mut self, name: &str, peer: &str) -> Result<u32> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(256);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg::default()));

        add_attr_string(&mut msg, IFLA_IFNAME, name);
        let linkinfo = begin_nested(&mut msg, IFLA_LINKINFO);
        add_attr_string(&mut msg, IFLA_INFO_KIND, "veth");
        let infodata = begin_nested(&mut msg, IFLA_INFO_DATA);
        // VETH_INFO_PEER carries a full link message: ifinfomsg + attrs
        let peer_attr = begin_nested(&mut msg, VETH_INFO_PEER);
        msg.extend_from_slice(as_bytes(&IfInfoMsg::default()));
        add_attr_string(&mut msg, IFLA_IFNAME, peer);
        end_nested(&mut msg, peer_attr);
        end_nested(&mut msg, infodata);
        end_nested(&mut msg, linkinfo);

        self.finish(
            &mut msg,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)?;
        self.get_ifindex(name)
    }

    pub fn delete_link(&mut self, ifindex: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ..Default::default()
        }));

        self.finish(&mut msg, RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    pub fn set_link_state(&mut self, ifindex: u32, up: bool) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ifi_flags: if up { IFF_UP } else { 0 },
            ifi_change: IFF_UP,
            ..Default::default()
        }));

        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Attaches a link to a bridge; a master of 0 detaches it.
    pub fn set_link_master(&mut self, ifindex: u32, master_ifindex: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ..Default::default()
        }));
        add_attr_u32(&mut msg, IFLA_MASTER, master_ifindex);

        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Moves a link into the network namespace behind `ns_fd`
    /// (an open `/proc/<pid>/ns/net`).
    pub fn set_link_netns(&mut self, ifindex: u32, ns_fd: RawFd) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ..Default::default()
        }));
        add_attr_u32(&mut msg, IFLA_NET_NS_FD, ns_fd as u32);

        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Renames a link. The link must be down.
    pub fn rename_link(&mut self, ifindex: u32, new_name: &str) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_index: ifindex as i32,
            ..Default::default()
        }));
        add_attr_string(&mut msg, IFLA_IFNAME, new_name);

        self.finish(&mut msg, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        self.send_and_ack(&msg)
    }

    /// Adds an IPv4 address with the network's prefix length.
    pub fn add_address(&mut self, ifindex: u32, addr: Ipv4Network) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfAddrMsg {
            ifa_family: libc::AF_INET as u8,
            ifa_prefixlen: addr.prefix(),
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: ifindex,
        }));

        let octets = addr.ip().octets();
        add_attr_bytes(&mut msg, IFA_LOCAL, &octets);
        add_attr_bytes(&mut msg, IFA_ADDRESS, &octets);

        self.finish(
            &mut msg,
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)
    }

    /// Installs the default IPv4 route via `gateway`.
    pub fn add_default_route(&mut self, gateway: Ipv4Addr) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&RtMsg {
            rtm_family: libc::AF_INET as u8,
            rtm_dst_len: 0,
            rtm_src_len: 0,
            rtm_tos: 0,
            rtm_table: RT_TABLE_MAIN,
            rtm_protocol: RTPROT_BOOT,
            rtm_scope: RT_SCOPE_UNIVERSE,
            rtm_type: RTN_UNICAST,
            rtm_flags: 0,
        }));
        add_attr_bytes(&mut msg, RTA_GATEWAY, &gateway.octets());

        self.finish(
            &mut msg,
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        self.send_and_ack(&msg)
    }

    /// Interface index lookup by name.
    pub fn get_ifindex(&self, name: &str) -> Result<u32> {
        let c_name = CString::new(name).map_err(|_| NetError::InvalidName(name.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(NetError::LinkNotFound(name.to_string()));
        }
        Ok(ifindex)
    }

    pub fn link_exists(&self, name: &str) -> bool {
        self.get_ifindex(name).is_ok()
    }
}

fn add_attr_string(msg: &mut Vec<u8>, attr_type: u16, value: &str) {
    let attr_len = mem::size_of::<NlAttr>() + value.len() + 1;
    let padded_len = (attr_len + 3) & !3;

    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    }));
    msg.extend_from_slice(value.as_bytes());
    msg.push(0);
    msg.extend(std::iter::repeat(0).take(padded_len - attr_len));
}

fn add_attr_u32(msg: &mut Vec<u8>, attr_type: u16, value: u32) {
    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: (mem::size_of::<NlAttr>() + mem::size_of::<u32>()) as u16,
        nla_type: attr_type,
    }));
    msg.extend_from_slice(&value.to_ne_bytes());
}

fn add_attr_bytes(msg: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = mem::size_of::<NlAttr>() + value.len();
    let padded_len = (attr_len + 3) & !3;

    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    }));
    msg.extend_from_slice(value);
    msg.extend(std::iter::repeat(0).take(padded_len - attr_len));
}

/// Reserves space for a nested attribute header and returns its offset
/// for [`end_nested`] to patch once the payload is in place.
fn begin_nested(msg: &mut Vec<u8>, attr_type: u16) -> usize {
    let start = msg.len();
    msg.extend_from_slice(as_bytes(&NlAttr {
        nla_len: 0,
        nla_type: attr_type | NLA_F_NESTED,
    }));
    start
}

fn end_nested(msg: &mut Vec<u8>, start: usize) {
    let len = (msg.len() - start) as u16;
    msg[start..start + 2].copy_from_slice(&len.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_string_padding() {
        let mut msg = Vec::new();
        add_attr_string(&mut msg, IFLA_IFNAME, "eth0");
        // header (4) + "eth0\0" (5) padded to the next 4-byte boundary
        assert_eq!(msg.len(), 12);
        let attr = unsafe { std::ptr::read_unaligned(msg.as_ptr() as *const NlAttr) };
        assert_eq!(attr.nla_len, 9);
        assert_eq!(attr.nla_type, IFLA_IFNAME);
    }

    #[test]
    fn test_nested_attr_length_patched() {
        let mut msg = Vec::new();
        let start = begin_nested(&mut msg, IFLA_LINKINFO);
        add_attr_string(&mut msg, IFLA_INFO_KIND, "veth");
        end_nested(&mut msg, start);

        let attr = unsafe { std::ptr::read_unaligned(msg.as_ptr() as *const NlAttr) };
        assert_eq!(attr.nla_type, IFLA_LINKINFO | NLA_F_NESTED);
        assert_eq!(attr.nla_len as usize, msg.len());
    }

    #[test]
    fn test_netlink_handle_creation() {
        // Opening a route socket needs no privileges
        assert!(NetlinkHandle::new().is_ok());
    }

    #[test]
    fn test_get_ifindex_loopback() {
        let handle = NetlinkHandle::new().unwrap();
        assert!(handle.get_ifindex("lo").unwrap() > 0);
        assert!(matches!(
            handle.get_ifindex("definitely-not-a-link"),
            Err(NetError::LinkNotFound(_))
        ));
    }
}
