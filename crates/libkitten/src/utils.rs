//! Identity and capability guards.

use caps::{CapSet, Capability};
use nix::unistd::geteuid;
use procfs::process::{ProcState, Process};
use uuid::Uuid;

use crate::{KittenError, Result};

/// Returns `prefix + "_" + 16 hex chars` from a cryptographically
/// strong random source.
pub fn generate_id(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &random[..16])
}

/// First 6 characters of the id suffix, used as the veth-name key so
/// that interface names stay within the kernel's 15-byte limit.
pub fn short_id(id: &str) -> &str {
    match id.split_once('_') {
        Some((_, suffix)) if suffix.len() > 6 => &suffix[..6],
        Some((_, suffix)) => suffix,
        None => id,
    }
}

/// Fails with [`KittenError::NotPrivileged`] when the effective UID is
/// not 0.
pub fn ensure_root() -> Result<()> {
    let euid = geteuid();
    if !euid.is_root() {
        return Err(KittenError::NotPrivileged(euid.as_raw()));
    }
    Ok(())
}

/// Consults the process's effective capability set. Namespace and mount
/// work needs CAP_SYS_ADMIN, the network fabric CAP_NET_ADMIN.
pub fn has_capability(cap: Capability) -> bool {
    caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false)
}

/// Whether a process with the given pid is alive (not a zombie).
pub fn process_exists(pid: i32) -> bool {
    let Ok(proc) = Process::new(pid) else {
        return false;
    };
    match proc.stat().and_then(|stat| stat.state()) {
        Ok(ProcState::Zombie | ProcState::Dead) => false,
        Ok(_) => true,
        Err(_) => false,
    }
}
