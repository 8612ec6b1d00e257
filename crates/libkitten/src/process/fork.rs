//! The self-re-exec trampoline.
//!
//! The parent cannot run arbitrary setup inside namespaces it has not
//! entered, so it clones a child directly into the requested namespaces
//! and has that child re-execute the current binary with the sentinel
//! first argument and the serialized config. `clone(2)` (rather than a
//! plain fork) is what applies the namespace flags at process-creation
//! time, which is also what makes the child PID 1 of a fresh PID
//! namespace.

use std::ffi::CString;

use nix::errno::Errno;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::unistd::{execv, Pid};

use crate::CHILD_SENTINEL;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Clones a child into the namespaces selected by `flags` which
/// re-executes `/proc/self/exe <sentinel> <config_json>`. Stdio is
/// inherited. Returns the child's pid in the parent's view.
pub fn spawn_trampoline(config_json: &str, flags: CloneFlags) -> Result<Pid, nix::Error> {
    let exe = CString::new("/proc/self/exe").map_err(|_| Errno::EINVAL)?;
    let argv = [
        CString::new("kitten").map_err(|_| Errno::EINVAL)?,
        CString::new(CHILD_SENTINEL).map_err(|_| Errno::EINVAL)?,
        CString::new(config_json).map_err(|_| Errno::EINVAL)?,
    ];

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let cb = Box::new(|| {
        // Only reached when exec itself failed; the exit code mirrors
        // the child entry point's launch-failure convention.
        match execv(&exe, &argv) {
            Ok(_) => unreachable!("execv returned on success"),
            Err(errno) => {
                tracing::error!(?errno, "failed to re-execute runtime binary");
                1
            }
        }
    });

    // SIGCHLD makes the clone waitable like a regular child.
    let pid = unsafe { clone(cb, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn test_spawn_without_namespaces() {
        // An empty mask degenerates to fork+exec; the re-executed binary
        // is the test runner, which exits non-zero on the bogus argv,
        // but the clone itself must succeed and be waitable.
        let pid = spawn_trampoline("{}", CloneFlags::empty()).unwrap();
        match waitpid(pid, None).unwrap() {
            WaitStatus::Exited(reaped, _) => assert_eq!(reaped, pid),
            status => panic!("unexpected wait status: {status:?}"),
        }
    }
}
