//! Entering another process's network namespace.
//!
//! Netlink sockets belong to the namespace they were opened in, so any
//! work inside a container's netns (renaming the veth peer, assigning
//! its address) runs a closure on a scratch thread that `setns(2)`-ed
//! into `/proc/<pid>/ns/net` first. The host thread is never moved.

use std::os::unix::io::{FromRawFd, OwnedFd};

use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;

use super::{NetError, Result};
use crate::namespaces::{ns_path, NamespaceType};

/// Opens `/proc/<pid>/ns/net` for `setns` or netlink link moves.
pub fn open_netns(pid: i32) -> Result<OwnedFd> {
    let path = ns_path(pid, NamespaceType::Net);
    let fd = open(&path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(NetError::Netns)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Runs `f` with the calling thread's network namespace switched to the
/// one of `pid`, on a dedicated thread so the rest of the process stays
/// in the host namespace.
pub fn with_netns<T, F>(pid: i32, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send,
    T: Send,
{
    let ns_fd = open_netns(pid)?;

    std::thread::scope(|scope| {
        scope
            .spawn(move || {
                setns(&ns_fd, CloneFlags::CLONE_NEWNET).map_err(NetError::Netns)?;
                f()
            })
            .join()
            .unwrap_or_else(|_| Err(NetError::Netns(nix::Error::UnknownErrno)))
    })
}
