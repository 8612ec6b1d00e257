//! The child entry point.
//!
//! Runs when the runtime binary is re-executed with the sentinel first
//! argument, already inside the namespaces the parent selected at
//! clone time. Everything here executes in strict order and
//! short-circuits on the first fatal error: hostname, mount isolation
//! and root pivot, pseudo-filesystems, `/dev` population, in-namespace
//! network finalization, environment, working directory, and finally
//! the exec of the user command, which replaces this process image —
//! making the command PID 1 of its PID namespace.

use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::fs;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{mknod, umask, Mode, SFlag};
use nix::unistd::{chdir, chroot, execvp, pivot_root, sethostname};

use crate::config::{KittenConfig, MountSpec, NetworkConfig};
use crate::network::veth::CONTAINER_IFNAME;
use crate::network::{NetError, NetlinkHandle};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_HOME: &str = "/root";

const ROUTE_RETRIES: u32 = 5;
const ROUTE_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("failed to parse container config")]
    ParseConfig(#[from] serde_json::Error),
    #[error("failed to set hostname")]
    Hostname(#[source] nix::Error),
    #[error("failed to make / private")]
    MountPropagation(#[source] nix::Error),
    #[error("failed to chroot into {path:?}")]
    Chroot {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to set up /dev in {path:?}")]
    Dev {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create device node {path:?}")]
    Mknod {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("failed to finalize container network")]
    Network(#[from] NetError),
    #[error("network config carries no container address")]
    MissingAddress,
    #[error("failed to chdir to {path}")]
    WorkingDir {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("command contains an interior nul byte")]
    InvalidCommand,
    #[error("failed to exec {command}")]
    Exec {
        command: String,
        #[source]
        source: nix::Error,
    },
}

/// Runs the full in-namespace setup and execs the target command.
/// Returns only on failure.
pub fn run(config_json: &str) -> Result<Infallible, ChildError> {
    let config: KittenConfig = serde_json::from_str(config_json)?;

    if config.namespaces.uts {
        sethostname(&config.hostname).map_err(ChildError::Hostname)?;
    }

    if config.namespaces.mount {
        setup_rootfs(&config)?;
    }

    if config.namespaces.net {
        let network = config.network.as_ref().ok_or(ChildError::MissingAddress)?;
        setup_network(network)?;
    }

    apply_env(&config);

    if !config.working_dir.is_empty() {
        chdir(Path::new(&config.working_dir)).map_err(|source| ChildError::WorkingDir {
            path: config.working_dir.clone(),
            source,
        })?;
    }

    exec_command(&config)
}

fn setup_rootfs(config: &KittenConfig) -> Result<(), ChildError> {
    // Isolate mount propagation before touching anything.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(ChildError::MountPropagation)?;

    if let Err(err) = pivot_rootfs(&config.rootfs) {
        tracing::warn!(?err, "pivot_root failed, falling back to chroot");
        chroot(&config.rootfs).map_err(|source| ChildError::Chroot {
            path: config.rootfs.clone(),
            source,
        })?;
        chdir("/").map_err(|source| ChildError::Chroot {
            path: config.rootfs.clone(),
            source,
        })?;
    }

    for mount_spec in &config.mounts {
        if let Err(err) = mount_filesystem(mount_spec) {
            tracing::warn!(mount = %mount_spec.target, ?err, "failed to mount");
        }
    }

    ensure_min_dev(Path::new("/dev"))
}

/// The pivot_root dance: bind the new root onto itself, pivot with the
/// old root parked at `.pivot_root`, then detach and remove it.
fn pivot_rootfs(new_root: &Path) -> Result<(), std::io::Error> {
    let put_old = new_root.join(".pivot_root");
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&put_old)?;

    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;

    pivot_root(new_root, &put_old)?;
    chdir("/")?;

    let put_old = Path::new("/.pivot_root");
    umount2(put_old, MntFlags::MNT_DETACH)?;
    fs::remove_dir_all(put_old)?;

    Ok(())
}

fn mount_filesystem(spec: &MountSpec) -> Result<(), std::io::Error> {
    // proc and sysfs targets must already exist in the rootfs
    if spec.fstype != "proc" && spec.fstype != "sysfs" {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&spec.target)?;
    }

    let data = if spec.data.is_empty() {
        None
    } else {
        Some(spec.data.as_str())
    };
    mount(
        Some(spec.source.as_str()),
        spec.target.as_str(),
        Some(spec.fstype.as_str()),
        spec.ms_flags(),
        data,
    )?;

    Ok(())
}

/// Same encoding as the Linux `makedev` macro.
fn makedev(major: u64, minor: u64) -> u64 {
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12) | ((major & !0xfff) << 32)
}

/// Populates `/dev` with the minimal character devices, the pts
/// directory and the `ptmx` symlink. Nodes that already exist (e.g.
/// bind-mounted in) are left alone.
fn ensure_min_dev(dev_dir: &Path) -> Result<(), ChildError> {
    let dev_err = |source| ChildError::Dev {
        path: dev_dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(dev_dir).map_err(dev_err)?;

    let devices = [
        ("null", 1, 3),
        ("zero", 1, 5),
        ("full", 1, 7),
        ("random", 1, 8),
        ("urandom", 1, 9),
    ];

    let old_mode = umask(Mode::empty());
    for (name, major, minor) in devices {
        let path = dev_dir.join(name);
        if path.exists() {
            continue;
        }
        if let Err(source) = mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(major, minor),
        ) {
            umask(old_mode);
            return Err(ChildError::Mknod { path, source });
        }
    }
    umask(old_mode);

    fs::create_dir_all(dev_dir.join("pts")).map_err(dev_err)?;

    let ptmx = dev_dir.join("ptmx");
    if ptmx.symlink_metadata().is_err() {
        symlink("pts/ptmx", &ptmx).map_err(dev_err)?;
    }

    Ok(())
}

/// Brings up the loopback and finalizes `eth0`. The parent may still be
/// moving and renaming the veth peer, so address and route assignment
/// is retried; `EEXIST` means the parent's own finalization won the
/// race and counts as success.
fn setup_network(network: &NetworkConfig) -> Result<(), ChildError> {
    let mut netlink = NetlinkHandle::new()?;

    let lo = netlink.get_ifindex("lo")?;
    netlink.set_link_state(lo, true)?;

    let container_ip = network.container_ip.ok_or(ChildError::MissingAddress)?;
    let gateway = network.gateway.ok_or(ChildError::MissingAddress)?;
    let prefix = network.subnet.map(|s| s.prefix()).unwrap_or(24);
    let addr = Ipv4Network::new(container_ip, prefix)
        .map_err(|err| NetError::AddressAllocation(err.to_string()))?;

    let mut last_err = None;
    for attempt in 0..ROUTE_RETRIES {
        match finalize_eth0(&mut netlink, addr, gateway) {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::debug!(attempt, ?err, "eth0 not ready yet");
                last_err = Some(err);
                thread::sleep(ROUTE_RETRY_DELAY);
            }
        }
    }

    Err(last_err.map(ChildError::Network).unwrap_or(ChildError::MissingAddress))
}

fn finalize_eth0(
    netlink: &mut NetlinkHandle,
    addr: Ipv4Network,
    gateway: std::net::Ipv4Addr,
) -> Result<(), NetError> {
    let eth0 = netlink.get_ifindex(CONTAINER_IFNAME)?;
    match netlink.add_address(eth0, addr) {
        Err(err) if !err.already_exists() => return Err(err),
        _ => {}
    }
    match netlink.add_default_route(gateway) {
        Err(err) if !err.already_exists() => return Err(err),
        _ => {}
    }
    Ok(())
}

fn apply_env(config: &KittenConfig) {
    for (key, value) in &config.env {
        env::set_var(key, value);
    }
    if env::var_os("PATH").is_none() {
        env::set_var("PATH", DEFAULT_PATH);
    }
    if env::var_os("HOME").is_none() {
        env::set_var("HOME", DEFAULT_HOME);
    }
}

fn exec_command(config: &KittenConfig) -> Result<Infallible, ChildError> {
    let argv: Vec<CString> = config
        .command
        .iter()
        .chain(config.args.iter())
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| ChildError::InvalidCommand)?;

    let program = argv.first().ok_or(ChildError::InvalidCommand)?.clone();
    match execvp(&program, &argv) {
        Ok(never) => match never {},
        Err(source) => Err(ChildError::Exec {
            command: config.command.join(" "),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_makedev_encoding() {
        // (major, minor) pairs of the standard character devices
        assert_eq!(makedev(1, 3), 259);
        assert_eq!(makedev(1, 5), 261);
        assert_eq!(makedev(1, 9), 265);
        // minor bits above 0xff land at bit 20
        assert_eq!(makedev(1, 0x100), (0x100 << 12) | (1 << 8));
    }

    #[test]
    #[serial]
    fn test_apply_env_sets_and_defaults() {
        let mut config = KittenConfig::default();
        config
            .env
            .insert("KITTEN_TEST_VAR".to_string(), "meow".to_string());

        let saved_path = env::var_os("PATH");
        env::remove_var("PATH");
        apply_env(&config);

        assert_eq!(env::var("KITTEN_TEST_VAR").unwrap(), "meow");
        assert_eq!(env::var("PATH").unwrap(), DEFAULT_PATH);

        env::remove_var("KITTEN_TEST_VAR");
        match saved_path {
            Some(path) => env::set_var("PATH", path),
            None => env::remove_var("PATH"),
        }
    }

    #[test]
    #[serial]
    fn test_apply_env_keeps_existing_path() {
        let saved_path = env::var_os("PATH");
        env::set_var("PATH", "/custom/bin");
        apply_env(&KittenConfig::default());
        assert_eq!(env::var("PATH").unwrap(), "/custom/bin");
        match saved_path {
            Some(path) => env::set_var("PATH", path),
            None => env::remove_var("PATH"),
        }
    }

    #[test]
    fn test_run_rejects_bad_config() {
        assert!(matches!(
            run("not json").unwrap_err(),
            ChildError::ParseConfig(_)
        ));
    }
}
