//! Reaping and terminating child processes.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// Blocks until `pid` exits and returns its exit code. A child killed
/// by a signal maps to the conventional `128 + signo`.
pub fn wait_for_exit(pid: Pid) -> Result<i32, nix::Error> {
    loop {
        match waitpid(pid, None)? {
            WaitStatus::Exited(_, code) => return Ok(code),
            WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
            // stopped/continued are not exits
            _ => continue,
        }
    }
}

/// Sends SIGTERM and gives the process `grace` to exit on its own (a
/// separate reaper thread collects it); past the deadline it is killed
/// with SIGKILL. Returns the exit code.
pub fn kill_with_grace(pid: Pid, grace: Duration) -> Result<i32, nix::Error> {
    kill(pid, Signal::SIGTERM)?;

    let (tx, rx) = mpsc::channel();
    let reaper = thread::spawn(move || {
        let _ = tx.send(wait_for_exit(pid));
    });

    let result = match rx.recv_timeout(grace) {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%pid, "graceful stop timed out, sending SIGKILL");
            let _ = kill(pid, Signal::SIGKILL);
            rx.recv().unwrap_or(Err(Errno::ECHILD))
        }
    };

    let _ = reaper.join();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn(cmd: &str) -> Pid {
        let child = Command::new("/bin/sh")
            .args(["-c", cmd])
            .spawn()
            .expect("spawn test child");
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_wait_for_exit_code() {
        let pid = spawn("exit 3");
        assert_eq!(wait_for_exit(pid).unwrap(), 3);
    }

    #[test]
    fn test_wait_for_missing_child() {
        assert!(wait_for_exit(Pid::from_raw(-999)).is_err());
    }

    #[test]
    fn test_graceful_termination() {
        let pid = spawn("sleep 30");
        let code = kill_with_grace(pid, Duration::from_secs(5)).unwrap();
        assert_eq!(code, 128 + Signal::SIGTERM as i32);
    }

    #[test]
    fn test_sigkill_after_grace() {
        let pid = spawn("trap '' TERM; sleep 30");
        // give the shell a moment to install the trap
        std::thread::sleep(Duration::from_millis(200));
        let code = kill_with_grace(pid, Duration::from_millis(300)).unwrap();
        assert_eq!(code, 128 + Signal::SIGKILL as i32);
    }
}
