//! Mapping from the namespace-enable flags to clone-flag bitmasks.
//!
//! Namespaces partition a global resource so that processes in
//! different namespaces see different views: UTS (hostname), PID
//! (process numbering), Mount (filesystem tree), Net (network stack),
//! IPC (System V objects) and User (UID mappings).

use std::path::PathBuf;

use nix::sched::CloneFlags;

use crate::config::NamespaceConfig;

/// The namespace kinds this runtime can place a container in, named by
/// their `/proc/<pid>/ns/<type>` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceType {
    Uts,
    Pid,
    Mount,
    Net,
    Ipc,
    User,
}

impl NamespaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceType::Uts => "uts",
            NamespaceType::Pid => "pid",
            NamespaceType::Mount => "mnt",
            NamespaceType::Net => "net",
            NamespaceType::Ipc => "ipc",
            NamespaceType::User => "user",
        }
    }

    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
        }
    }
}

/// Builds the clone-flag bitmask selecting the enabled namespaces.
pub fn clone_flags(ns: &NamespaceConfig) -> CloneFlags {
    let mut flags = CloneFlags::empty();

    if ns.uts {
        flags |= CloneFlags::CLONE_NEWUTS;
    }
    if ns.pid {
        flags |= CloneFlags::CLONE_NEWPID;
    }
    if ns.mount {
        flags |= CloneFlags::CLONE_NEWNS;
    }
    if ns.net {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    if ns.ipc {
        flags |= CloneFlags::CLONE_NEWIPC;
    }
    if ns.user {
        flags |= CloneFlags::CLONE_NEWUSER;
    }

    flags
}

pub fn ns_path(pid: i32, kind: NamespaceType) -> PathBuf {
    PathBuf::from(format!("/proc/{}/ns/{}", pid, kind.as_str()))
}

pub fn namespace_exists(pid: i32, kind: NamespaceType) -> bool {
    ns_path(pid, kind).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_flags_default_mask() {
        let flags = clone_flags(&NamespaceConfig::default());
        assert!(flags.contains(
            CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWIPC
        ));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn test_clone_flags_empty() {
        let ns = NamespaceConfig {
            uts: false,
            pid: false,
            mount: false,
            net: false,
            ipc: false,
            user: false,
        };
        assert!(clone_flags(&ns).is_empty());
    }

    #[test]
    fn test_clone_flags_net() {
        let ns = NamespaceConfig {
            net: true,
            ..Default::default()
        };
        assert!(clone_flags(&ns).contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_ns_path() {
        assert_eq!(
            ns_path(42, NamespaceType::Net),
            PathBuf::from("/proc/42/ns/net")
        );
        assert_eq!(
            ns_path(1, NamespaceType::Mount),
            PathBuf::from("/proc/1/ns/mnt")
        );
    }

    #[test]
    fn test_namespace_exists_for_self() {
        let pid = std::process::id() as i32;
        assert!(namespace_exists(pid, NamespaceType::Net));
        assert!(namespace_exists(pid, NamespaceType::Uts));
        assert!(!namespace_exists(-1, NamespaceType::Net));
    }
}
