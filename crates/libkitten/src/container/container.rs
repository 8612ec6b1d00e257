//! The container handle.
//!
//! One `Kitten` owns one child process and the host side of its veth
//! pair. `start` drives the two-phase protocol: the parent prepares the
//! host network fabric, clones the child into its namespaces through
//! the re-exec trampoline, then finishes the network wiring from the
//! outside while the child (see [`crate::child`]) finishes it from the
//! inside.

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use caps::Capability;
use chrono::Utc;
use ipnetwork::Ipv4Network;
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::unistd::{geteuid, Pid};

use crate::config::{self, KittenConfig};
use crate::container::{ContainerStatus, KittenInfo};
use crate::namespaces::clone_flags;
use crate::network::{self, NetError};
use crate::process::{kill_with_grace, spawn_trampoline, wait_for_exit};
use crate::utils::{generate_id, has_capability};
use crate::{KittenError, Result};

/// How long `stop` waits for a SIGTERM'd child before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Inner {
    config: KittenConfig,
    status: ContainerStatus,
    pid: Option<Pid>,
    exit_code: Option<i32>,
    start_time: Option<chrono::DateTime<Utc>>,
    stop_time: Option<chrono::DateTime<Utc>>,
    veth_host: Option<String>,
    veth_peer: Option<String>,
    container_ip: Option<Ipv4Addr>,
    cleaned: bool,
}

#[derive(Debug)]
pub struct Kitten {
    id: String,
    inner: Mutex<Inner>,
}

impl Kitten {
    /// Validates the config and builds a handle in the `Created` state,
    /// generating an id when none was supplied.
    pub fn new(mut config: KittenConfig) -> Result<Self> {
        config.validate()?;
        config::validate_rootfs(&config.rootfs)?;

        if config.id.is_empty() {
            config.id = generate_id("kitten");
        }
        let id = config.id.clone();

        Ok(Self {
            id,
            inner: Mutex::new(Inner {
                config,
                status: ContainerStatus::Created,
                pid: None,
                exit_code: None,
                start_time: None,
                stop_time: None,
                veth_host: None,
                veth_peer: None,
                container_ip: None,
                cleaned: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Launches the container. Holds the handle lock for the whole
    /// start sequence; any failure past the state check terminates the
    /// child (if any), cleans up the host fabric and leaves the handle
    /// in the terminal `Error` state.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();

        if inner.status != ContainerStatus::Created {
            return Err(KittenError::AlreadyStarted(inner.status));
        }

        match self.start_locked(&mut inner) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.terminate_locked(&mut inner);
                inner.status = ContainerStatus::Error;
                Err(err)
            }
        }
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.config.namespaces.net {
            if !has_capability(Capability::CAP_NET_ADMIN) {
                return Err(KittenError::NotPrivileged(geteuid().as_raw()));
            }

            let (host, peer) = network::create_veth_pair(&self.id)?;
            inner.veth_host = Some(host);
            inner.veth_peer = Some(peer);

            let netcfg = inner
                .config
                .network
                .as_mut()
                .ok_or(config::ConfigError::NetworkRequired)?;
            let subnet = netcfg.subnet.unwrap_or_else(default_subnet);
            let ip = network::allocate_ip(subnet, netcfg.gateway, netcfg.container_ip)?;
            netcfg.container_ip = Some(ip);
            inner.container_ip = Some(ip);
            tracing::debug!(id = %self.id, %ip, "created veth pair and allocated address");
        }

        if !inner.config.rootfs.exists() {
            return Err(KittenError::RootfsMissing(inner.config.rootfs.clone()));
        }

        let config_json = serde_json::to_string(&inner.config)?;

        // CLONE_NEWNS is always added so the child gets a private mount
        // propagation view even when Mount is the only namespace in play.
        let flags = clone_flags(&inner.config.namespaces) | CloneFlags::CLONE_NEWNS;
        let pid = spawn_trampoline(&config_json, flags).map_err(KittenError::SpawnFailed)?;

        inner.pid = Some(pid);
        inner.start_time = Some(Utc::now());
        inner.status = ContainerStatus::Running;
        tracing::info!(id = %self.id, %pid, "container started");

        if inner.config.namespaces.net {
            self.finalize_network(inner)?;
        }

        Ok(())
    }

    /// Parent-side network finalization: the peer moves into the
    /// child's netns and becomes `eth0`, the host end attaches to the
    /// bridge, and address/route/port-forwards are installed. The
    /// address step duplicates the child's own (§ the dual path covers
    /// whichever side finishes first).
    fn finalize_network(&self, inner: &mut Inner) -> Result<()> {
        let pid = inner
            .pid
            .ok_or(KittenError::NotRunning(inner.status))?
            .as_raw();
        let peer = inner
            .veth_peer
            .clone()
            .ok_or_else(|| NetError::LinkNotFound("veth peer".to_string()))?;
        let host = inner
            .veth_host
            .clone()
            .ok_or_else(|| NetError::LinkNotFound("veth host".to_string()))?;
        let netcfg = inner
            .config
            .network
            .clone()
            .ok_or(config::ConfigError::NetworkRequired)?;
        let ip = inner
            .container_ip
            .ok_or_else(|| NetError::AddressAllocation("no address assigned".to_string()))?;
        let gateway = netcfg
            .gateway
            .ok_or_else(|| NetError::AddressAllocation("network has no gateway".to_string()))?;

        network::move_veth_to_namespace(&peer, pid)?;
        network::rename_container_veth(pid, &peer)?;
        network::configure_host_veth(&host, &netcfg)?;

        let prefix = netcfg.subnet.map(|s| s.prefix()).unwrap_or(24);
        let addr = Ipv4Network::new(ip, prefix)
            .map_err(|err| NetError::AddressAllocation(err.to_string()))?;
        network::assign_container_address(pid, addr, gateway)?;

        for mapping in &netcfg.port_mappings {
            network::add_port_forward(mapping, ip)?;
        }

        tracing::debug!(id = %self.id, "network finalized");
        Ok(())
    }

    /// Reaps the child, records the exit code, transitions to `Stopped`
    /// and cleans up. Blocks without holding the handle lock.
    pub fn wait(&self) -> Result<i32> {
        let pid = {
            let inner = self.lock();
            inner.pid.ok_or(KittenError::NotRunning(inner.status))?
        };

        let reaped = wait_for_exit(pid);

        let mut inner = self.lock();
        let exit_code = match reaped {
            Ok(code) => code,
            // a concurrent stop() won the reap; its record stands
            Err(Errno::ECHILD) => inner.exit_code.unwrap_or(1),
            Err(_) => 1,
        };
        inner.exit_code = Some(exit_code);
        if inner.status == ContainerStatus::Running {
            inner.status = ContainerStatus::Stopped;
            inner.stop_time = Some(Utc::now());
        }
        inner.pid = None;
        self.cleanup_locked(&mut inner);

        tracing::info!(id = %self.id, exit_code, "container exited");
        Ok(exit_code)
    }

    /// Terminates a running container: SIGTERM, a 5 second grace
    /// window on a separate reaping task, then SIGKILL.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();

        if inner.status != ContainerStatus::Running {
            return Err(KittenError::NotRunning(inner.status));
        }
        let pid = inner.pid.ok_or(KittenError::NotRunning(inner.status))?;

        match kill_with_grace(pid, STOP_GRACE) {
            Ok(code) => inner.exit_code = Some(code),
            // already gone or reaped elsewhere
            Err(Errno::ECHILD) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(KittenError::Nix(err)),
        }

        inner.status = ContainerStatus::Stopped;
        inner.stop_time = Some(Utc::now());
        inner.pid = None;
        self.cleanup_locked(&mut inner);

        tracing::info!(id = %self.id, "container stopped");
        Ok(())
    }

    /// Kills the child if it is still around and releases host
    /// resources; used on mid-start failures where the handle lock is
    /// already held.
    fn terminate_locked(&self, inner: &mut Inner) {
        if let Some(pid) = inner.pid.take() {
            if let Err(err) = kill_with_grace(pid, STOP_GRACE) {
                tracing::warn!(id = %self.id, ?err, "failed to terminate child");
            }
            inner.stop_time = Some(Utc::now());
        }
        self.cleanup_locked(inner);
    }

    /// Removes this container's port-forward rules, deletes the host
    /// veth (the peer is reaped with the namespace) and returns the
    /// address to the allocator. Idempotent; errors are swallowed.
    fn cleanup_locked(&self, inner: &mut Inner) {
        if inner.cleaned || !inner.config.namespaces.net {
            inner.cleaned = true;
            return;
        }
        inner.cleaned = true;

        if let (Some(netcfg), Some(ip)) = (inner.config.network.as_ref(), inner.container_ip) {
            for mapping in &netcfg.port_mappings {
                network::remove_port_forward(mapping, ip);
            }
            let subnet = netcfg.subnet.unwrap_or_else(default_subnet);
            network::release_ip(subnet, ip);
        }

        if let Some(host) = inner.veth_host.take() {
            if let Err(err) = network::delete_veth(&host) {
                tracing::debug!(id = %self.id, ?err, "failed to delete host veth");
            }
        }
        inner.veth_peer = None;
    }

    pub fn pid(&self) -> Option<i32> {
        self.lock().pid.map(Pid::as_raw)
    }

    pub fn status(&self) -> ContainerStatus {
        self.lock().status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn container_ip(&self) -> Option<Ipv4Addr> {
        self.lock().container_ip
    }

    pub fn info(&self) -> KittenInfo {
        let inner = self.lock();
        KittenInfo {
            id: self.id.clone(),
            status: inner.status,
            pid: inner.pid.map(Pid::as_raw),
            exit_code: inner.exit_code,
            start_time: inner.start_time,
            stop_time: inner.stop_time,
            container_ip: inner.container_ip,
            config: inner.config.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("container handle poisoned")
    }
}

fn default_subnet() -> Ipv4Network {
    network::bridge::DEFAULT_BRIDGE_SUBNET
        .parse()
        .expect("valid default subnet")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn test_config(rootfs: &std::path::Path) -> KittenConfig {
        KittenConfig {
            rootfs: rootfs.to_path_buf(),
            command: vec!["/bin/true".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_generates_id() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let kitten = Kitten::new(test_config(tmp.path()))?;
        assert!(kitten.id().starts_with("kitten_"));
        assert_eq!(kitten.status(), ContainerStatus::Created);
        assert_eq!(kitten.pid(), None);
        Ok(())
    }

    #[test]
    fn test_new_keeps_supplied_id() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = test_config(tmp.path());
        config.id = "kitten_feedfacecafe0123".to_string();
        let kitten = Kitten::new(config)?;
        assert_eq!(kitten.id(), "kitten_feedfacecafe0123");
        Ok(())
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = KittenConfig::default();
        assert!(matches!(
            Kitten::new(config),
            Err(KittenError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stop_on_created_fails() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let kitten = Kitten::new(test_config(tmp.path()))?;
        assert!(matches!(
            kitten.stop(),
            Err(KittenError::NotRunning(ContainerStatus::Created))
        ));
        Ok(())
    }

    #[test]
    fn test_wait_before_start_fails() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let kitten = Kitten::new(test_config(tmp.path()))?;
        assert!(matches!(kitten.wait(), Err(KittenError::NotRunning(_))));
        Ok(())
    }

    #[test]
    fn test_start_with_missing_rootfs() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir(&rootfs)?;
        let kitten = Kitten::new(test_config(&rootfs))?;

        // rootfs vanishes between validation and start
        std::fs::remove_dir(&rootfs)?;
        assert!(matches!(
            kitten.start(),
            Err(KittenError::RootfsMissing(_))
        ));
        assert_eq!(kitten.status(), ContainerStatus::Error);

        // Error is terminal
        assert!(matches!(
            kitten.start(),
            Err(KittenError::AlreadyStarted(ContainerStatus::Error))
        ));
        Ok(())
    }

    #[test]
    fn test_info_snapshot() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let kitten = Kitten::new(test_config(tmp.path()))?;
        let info = kitten.info();
        assert_eq!(info.id, kitten.id());
        assert_eq!(info.status, ContainerStatus::Created);
        assert!(info.pid.is_none());
        assert!(info.start_time.is_none());
        Ok(())
    }
}
