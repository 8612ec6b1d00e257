//! Typed description of a single container and its validation.
//!
//! A [`KittenConfig`] is the complete description needed to launch one
//! container. It is serialized to JSON by the parent and handed to the
//! re-executed child on the command line, so everything here derives
//! `Serialize`/`Deserialize`.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnetwork::Ipv4Network;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("rootfs is required")]
    RootfsRequired,
    #[error("rootfs path does not exist: {0:?}")]
    RootfsNotFound(PathBuf),
    #[error("rootfs must be a directory: {0:?}")]
    RootfsNotADirectory(PathBuf),
    #[error("command is required")]
    CommandRequired,
    #[error("network config required when net namespace enabled")]
    NetworkRequired,
    #[error("mount target required for mount {0}")]
    MountTargetRequired(usize),
}

/// Which of the six supported namespaces a container is created in.
///
/// The default enables everything except Net (which needs an explicit
/// network attachment) and User (no UID mapping support).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    #[serde(rename = "UTS")]
    pub uts: bool,
    #[serde(rename = "PID")]
    pub pid: bool,
    #[serde(rename = "Mount")]
    pub mount: bool,
    #[serde(rename = "Net")]
    pub net: bool,
    #[serde(rename = "IPC")]
    pub ipc: bool,
    #[serde(rename = "User")]
    pub user: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            uts: true,
            pid: true,
            mount: true,
            net: false,
            ipc: true,
            user: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Bridge,
    Host,
    None,
}

impl Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Bridge => write!(f, "bridge"),
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// One host-port to container-port forwarding entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Networking attachment of a container. Present exactly when the Net
/// namespace is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub bridge_name: String,
    /// Assigned at start time unless a static address was requested.
    #[serde(default)]
    pub container_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub subnet: Option<Ipv4Network>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
}

/// One mount applied by the child after the root pivot. `flags` holds
/// raw `MS_*` bits so the config stays a plain wire type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub fstype: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub data: String,
}

impl MountSpec {
    pub fn ms_flags(&self) -> MsFlags {
        MsFlags::from_bits_truncate(self.flags as libc::c_ulong)
    }
}

/// The complete description needed to launch one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KittenConfig {
    pub id: String,
    pub rootfs: PathBuf,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub hostname: String,
    pub namespaces: NamespaceConfig,
    pub network: Option<NetworkConfig>,
    pub mounts: Vec<MountSpec>,
    pub working_dir: String,
    pub env: HashMap<String, String>,
}

impl Default for KittenConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            rootfs: PathBuf::new(),
            command: Vec::new(),
            args: Vec::new(),
            hostname: "kitten".to_string(),
            namespaces: NamespaceConfig::default(),
            network: None,
            mounts: default_mounts(),
            working_dir: "/".to_string(),
            env: HashMap::new(),
        }
    }
}

impl KittenConfig {
    /// Checks the hard requirements for launching: a rootfs directory,
    /// a command, a network attachment iff the Net namespace is on, and
    /// a target for every mount.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rootfs.as_os_str().is_empty() {
            return Err(ConfigError::RootfsRequired);
        }

        match self.rootfs.metadata() {
            Ok(meta) if !meta.is_dir() => {
                return Err(ConfigError::RootfsNotADirectory(self.rootfs.clone()))
            }
            Ok(_) => {}
            Err(_) => return Err(ConfigError::RootfsNotFound(self.rootfs.clone())),
        }

        if self.command.is_empty() {
            return Err(ConfigError::CommandRequired);
        }

        if self.namespaces.net && self.network.is_none() {
            return Err(ConfigError::NetworkRequired);
        }

        for (i, mount) in self.mounts.iter().enumerate() {
            if mount.target.is_empty() {
                return Err(ConfigError::MountTargetRequired(i));
            }
        }

        Ok(())
    }
}

/// The pseudo-filesystems every container gets unless overridden:
/// proc, a tmpfs `/dev` with devpts under it, a read-only sysfs and a
/// tmpfs `/run`.
pub fn default_mounts() -> Vec<MountSpec> {
    vec![
        MountSpec {
            source: "proc".to_string(),
            target: "/proc".to_string(),
            fstype: "proc".to_string(),
            flags: 0,
            data: String::new(),
        },
        MountSpec {
            source: "tmpfs".to_string(),
            target: "/dev".to_string(),
            fstype: "tmpfs".to_string(),
            flags: (MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME).bits() as u64,
            data: "mode=755".to_string(),
        },
        MountSpec {
            source: "devpts".to_string(),
            target: "/dev/pts".to_string(),
            fstype: "devpts".to_string(),
            flags: (MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC).bits() as u64,
            data: "newinstance,ptmxmode=0666,mode=0620".to_string(),
        },
        MountSpec {
            source: "sysfs".to_string(),
            target: "/sys".to_string(),
            fstype: "sysfs".to_string(),
            flags: (MsFlags::MS_NOSUID
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NODEV
                | MsFlags::MS_RDONLY)
                .bits() as u64,
            data: String::new(),
        },
        MountSpec {
            source: "tmpfs".to_string(),
            target: "/run".to_string(),
            fstype: "tmpfs".to_string(),
            flags: (MsFlags::MS_NOSUID | MsFlags::MS_NODEV).bits() as u64,
            data: "mode=755".to_string(),
        },
    ]
}

/// Warns (does not fail) when a rootfs is missing the directories any
/// useful root filesystem carries.
pub fn validate_rootfs(rootfs: &std::path::Path) -> Result<(), ConfigError> {
    let meta = rootfs
        .metadata()
        .map_err(|_| ConfigError::RootfsNotFound(rootfs.to_path_buf()))?;
    if !meta.is_dir() {
        return Err(ConfigError::RootfsNotADirectory(rootfs.to_path_buf()));
    }

    for dir in ["bin", "etc", "lib", "usr"] {
        if !rootfs.join(dir).is_dir() {
            tracing::warn!(
                ?rootfs,
                dir,
                "rootfs missing directory (might not be a valid root filesystem)"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn valid_config(rootfs: &std::path::Path) -> KittenConfig {
        KittenConfig {
            rootfs: rootfs.to_path_buf(),
            command: vec!["/bin/true".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_namespaces() {
        let ns = NamespaceConfig::default();
        assert!(ns.uts && ns.pid && ns.mount && ns.ipc);
        assert!(!ns.net && !ns.user);
    }

    #[test]
    fn test_default_mounts() {
        let mounts = default_mounts();
        let targets: Vec<&str> = mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, ["/proc", "/dev", "/dev/pts", "/sys", "/run"]);
        // sysfs is mounted read-only
        let sys = mounts.iter().find(|m| m.target == "/sys").unwrap();
        assert!(sys.ms_flags().contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_validate_requires_rootfs() {
        let config = KittenConfig {
            command: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::RootfsRequired)));
    }

    #[test]
    fn test_validate_rootfs_must_exist() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = valid_config(tmp.path());
        config.rootfs = tmp.path().join("nope");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RootfsNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_validate_rootfs_must_be_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("rootfs");
        std::fs::write(&file, "not a dir")?;
        let config = valid_config(&file);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RootfsNotADirectory(_))
        ));
        Ok(())
    }

    #[test]
    fn test_validate_requires_command() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = valid_config(tmp.path());
        config.command.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CommandRequired)
        ));
        Ok(())
    }

    #[test]
    fn test_validate_net_requires_network() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = valid_config(tmp.path());
        config.namespaces.net = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NetworkRequired)
        ));

        config.network = Some(NetworkConfig::default());
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_validate_mount_target_required() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = valid_config(tmp.path());
        config.mounts.push(MountSpec {
            source: "tmpfs".to_string(),
            target: String::new(),
            fstype: "tmpfs".to_string(),
            flags: 0,
            data: String::new(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MountTargetRequired(5))
        ));
        Ok(())
    }

    #[test]
    fn test_config_json_round_trip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut config = valid_config(tmp.path());
        config.namespaces.net = true;
        config.network = Some(NetworkConfig {
            mode: NetworkMode::Bridge,
            bridge_name: "kitten0".to_string(),
            container_ip: Some("10.0.0.7".parse()?),
            gateway: Some("10.0.0.1".parse()?),
            subnet: Some("10.0.0.0/24".parse()?),
            port_mappings: vec![PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: Protocol::Tcp,
            }],
        });
        config.env.insert("FOO".to_string(), "bar".to_string());

        let json = serde_json::to_string(&config)?;
        let parsed: KittenConfig = serde_json::from_str(&json)?;
        assert_eq!(config, parsed);
        Ok(())
    }
}
