//! The orchestrator.
//!
//! A `Manager` drives a whole deployment: it materializes the declared
//! networks, starts containers in dependency order with restart
//! supervision, and tears everything down in reverse order. The manager
//! is a cheap clonable handle over shared state so supervisor and
//! waiter threads can outlive the caller's borrow.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::config::{
    default_mounts, KittenConfig, NamespaceConfig, NetworkConfig, NetworkMode, PortMapping,
    Protocol,
};
use crate::container::Kitten;
use crate::network::{create_bridge, delete_bridge};
use crate::{KittenError, Result};

/// Every `driver = "bridge"` network currently lands on this one host
/// bridge, so declared bridge networks share it; the per-bridge
/// refcount in the network fabric keeps teardown correct.
pub const DEFAULT_BRIDGE_NAME: &str = "kitten0";

/// Pause between container starts to reduce contention on host network
/// setup.
const START_PAUSE: Duration = Duration::from_millis(100);

/// Backoff before a supervised container is relaunched.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure,
}

/// One container entry of a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub hostname: String,
    #[serde(rename = "workdir")]
    pub working_dir: String,
    pub environment: HashMap<String, String>,
    /// `"HOST:CONTAINER"` strings, tcp only.
    pub ports: Vec<String>,
    /// Name of a network declared in the same deployment, or empty.
    pub network: String,
    pub ip: Option<Ipv4Addr>,
    pub depends_on: Vec<String>,
    pub restart: RestartPolicy,
    pub namespaces: Option<NamespaceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    pub driver: NetworkMode,
    pub subnet: Option<Ipv4Network>,
    pub gateway: Option<Ipv4Addr>,
}

/// A deployment: named containers over named networks. `BTreeMap`
/// keeps scan order deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub version: String,
    pub containers: BTreeMap<String, ContainerSpec>,
    pub networks: BTreeMap<String, NetworkSpec>,
}

#[derive(Default)]
struct ManagerState {
    containers: HashMap<String, Arc<Kitten>>,
    networks: HashMap<String, NetworkConfig>,
}

struct Shared {
    config: DeploymentConfig,
    state: RwLock<ManagerState>,
}

#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    pub fn from_json(config_json: &str) -> Result<Self> {
        let config: DeploymentConfig = serde_json::from_str(config_json)?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ManagerState::default()),
            }),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Creates the declared networks and starts every container in a
    /// valid topological order of `depends_on`, with restart
    /// supervision where requested. Holds the manager lock throughout;
    /// aborts on the first failing container, leaving the already
    /// started ones running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.write();

        self.create_networks(&mut state)?;

        let containers = &self.shared.config.containers;
        let mut started: HashSet<&str> = HashSet::new();

        while started.len() < containers.len() {
            let mut progress = false;

            for (name, spec) in containers {
                if started.contains(name.as_str()) {
                    continue;
                }
                if !spec
                    .depends_on
                    .iter()
                    .all(|dep| started.contains(dep.as_str()))
                {
                    continue;
                }

                tracing::info!(container = %name, "starting container");
                self.start_container_locked(&mut state, name, spec)?;
                self.maybe_spawn_supervisor(name, spec);
                started.insert(name);
                progress = true;

                thread::sleep(START_PAUSE);
            }

            if !progress {
                return Err(KittenError::DependencyCycle);
            }
        }

        tracing::info!(count = started.len(), "all containers started");
        Ok(())
    }

    /// Stops every container in reverse dependency order (failures are
    /// warnings), then drops all handles and tears down the bridges
    /// this deployment created.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.write();
        tracing::info!("stopping all containers");

        for name in self.stop_order() {
            if let Some(kitten) = state.containers.get(&name) {
                tracing::info!(container = %name, "stopping container");
                if let Err(err) = kitten.stop() {
                    tracing::warn!(container = %name, ?err, "failed to stop container");
                }
            }
        }
        state.containers.clear();

        for (name, netcfg) in state.networks.drain() {
            if netcfg.mode == NetworkMode::Bridge && !netcfg.bridge_name.is_empty() {
                match delete_bridge(&netcfg.bridge_name) {
                    Ok(()) => tracing::info!(network = %name, "cleaned up network"),
                    Err(err) => {
                        tracing::warn!(network = %name, ?err, "failed to delete bridge")
                    }
                }
            }
        }

        tracing::info!("all containers stopped");
        Ok(())
    }

    /// Waits for every currently running container concurrently and
    /// returns the first error.
    pub fn wait(&self) -> Result<()> {
        let handles: Vec<Arc<Kitten>> = {
            let state = self.read();
            state.containers.values().map(Arc::clone).collect()
        };

        let mut first_err = None;
        thread::scope(|scope| {
            let waiters: Vec<_> = handles
                .iter()
                .map(|kitten| scope.spawn(move || kitten.wait()))
                .collect();
            for waiter in waiters {
                match waiter.join() {
                    Ok(Ok(_)) | Err(_) => {}
                    Ok(Err(err)) => {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                }
            }
        });

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops and relaunches a single container.
    pub fn restart(&self, name: &str) -> Result<()> {
        let mut state = self.write();

        let kitten = state
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| KittenError::ContainerNotFound(name.to_string()))?;
        let spec = self
            .shared
            .config
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| KittenError::ContainerNotFound(name.to_string()))?;

        tracing::info!(container = %name, "restarting container");
        kitten.stop()?;
        self.start_container_locked(&mut state, name, &spec)?;
        self.maybe_spawn_supervisor(name, &spec);
        Ok(())
    }

    /// `"running"` while the handle still owns a live child, else
    /// `"stopped"`.
    pub fn status(&self) -> HashMap<String, String> {
        let state = self.read();
        state
            .containers
            .iter()
            .map(|(name, kitten)| {
                let status = if kitten.pid().is_some() {
                    "running"
                } else {
                    "stopped"
                };
                (name.clone(), status.to_string())
            })
            .collect()
    }

    pub fn get_container(&self, name: &str) -> Option<Arc<Kitten>> {
        self.read().containers.get(name).cloned()
    }

    pub fn list_containers(&self) -> Vec<String> {
        self.read().containers.keys().cloned().collect()
    }

    fn create_networks(&self, state: &mut ManagerState) -> Result<()> {
        for (name, spec) in &self.shared.config.networks {
            let gateway = spec
                .gateway
                .or_else(|| spec.subnet.map(|_| Ipv4Addr::new(10, 0, 0, 1)));

            let mut netcfg = NetworkConfig {
                mode: spec.driver,
                subnet: spec.subnet,
                gateway,
                ..Default::default()
            };

            if spec.driver == NetworkMode::Bridge {
                netcfg.bridge_name = DEFAULT_BRIDGE_NAME.to_string();
                create_bridge(DEFAULT_BRIDGE_NAME, spec.subnet, gateway)?;
                tracing::info!(bridge = DEFAULT_BRIDGE_NAME, "created bridge");
            }

            state.networks.insert(name.clone(), netcfg);
            tracing::info!(network = %name, driver = %spec.driver, "created network");
        }

        Ok(())
    }

    /// Builds the container config from its spec and launches it.
    /// The caller must hold the write lock.
    fn start_container_locked(
        &self,
        state: &mut ManagerState,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<()> {
        let mut config = KittenConfig {
            rootfs: spec.image.clone().into(),
            command: spec.command.clone(),
            env: spec.environment.clone(),
            ..Default::default()
        };

        config.hostname = if spec.hostname.is_empty() {
            name.to_string()
        } else {
            spec.hostname.clone()
        };
        config.working_dir = if spec.working_dir.is_empty() {
            "/".to_string()
        } else {
            spec.working_dir.clone()
        };

        if let Some(namespaces) = spec.namespaces {
            config.namespaces = namespaces;
        }

        if !spec.network.is_empty() {
            if let Some(netcfg) = state.networks.get(&spec.network) {
                config.namespaces.net = true;
                let mut network = netcfg.clone();
                network.container_ip = spec.ip;
                network.port_mappings = spec
                    .ports
                    .iter()
                    .map(|mapping| parse_port_mapping(mapping))
                    .collect::<Result<_>>()?;
                config.network = Some(network);
            }
        }

        config.mounts = default_mounts();

        let kitten = Arc::new(Kitten::new(config)?);
        kitten.start()?;
        state.containers.insert(name.to_string(), kitten);

        Ok(())
    }

    fn maybe_spawn_supervisor(&self, name: &str, spec: &ContainerSpec) {
        if !matches!(spec.restart, RestartPolicy::Always | RestartPolicy::OnFailure) {
            return;
        }
        let manager = self.clone();
        let name = name.to_string();
        let spec = spec.clone();
        thread::spawn(move || manager.supervise(&name, &spec));
    }

    /// Restart supervision: reap, decide by policy, relaunch after a
    /// short backoff. Exits as soon as the container disappears from
    /// the map (it was stopped externally).
    fn supervise(&self, name: &str, spec: &ContainerSpec) {
        loop {
            let kitten = {
                let state = self.read();
                match state.containers.get(name) {
                    Some(kitten) => Arc::clone(kitten),
                    None => return,
                }
            };

            let exited = kitten.wait();
            let should_restart = match spec.restart {
                RestartPolicy::Always => true,
                RestartPolicy::OnFailure => !matches!(&exited, Ok(0)),
                RestartPolicy::No => false,
            };
            if !should_restart {
                return;
            }

            tracing::info!(container = %name, ?exited, "container exited, restarting");
            thread::sleep(RESTART_DELAY);

            let mut state = self.write();
            if !state.containers.contains_key(name) {
                return;
            }
            if let Err(err) = self.start_container_locked(&mut state, name, spec) {
                tracing::error!(container = %name, ?err, "failed to restart container");
                return;
            }
        }
    }

    /// Reverse-topological order: DFS post-order over `depends_on`,
    /// reversed, so dependents stop before their dependencies.
    fn stop_order(&self) -> Vec<String> {
        let containers = &self.shared.config.containers;
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(containers.len());

        fn visit(
            name: &str,
            containers: &BTreeMap<String, ContainerSpec>,
            visited: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) {
            if !visited.insert(name.to_string()) {
                return;
            }
            if let Some(spec) = containers.get(name) {
                for dep in &spec.depends_on {
                    visit(dep, containers, visited, order);
                }
            }
            order.push(name.to_string());
        }

        for name in containers.keys() {
            visit(name, containers, &mut visited, &mut order);
        }

        order.reverse();
        order
    }

    fn read(&self) -> RwLockReadGuard<'_, ManagerState> {
        self.shared.state.read().expect("manager state poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, ManagerState> {
        self.shared.state.write().expect("manager state poisoned")
    }
}

/// Parses one `"HOST:CONTAINER"` port string; the protocol is tcp.
fn parse_port_mapping(mapping: &str) -> Result<PortMapping> {
    let invalid = || KittenError::InvalidPortMapping(mapping.to_string());

    let (host, container) = mapping.split_once(':').ok_or_else(invalid)?;
    let host_port = host.trim().parse().map_err(|_| invalid())?;
    let container_port = container.trim().parse().map_err(|_| invalid())?;

    Ok(PortMapping {
        host_port,
        container_port,
        protocol: Protocol::Tcp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;

    const DEPLOYMENT: &str = r#"{
        "version": "1",
        "containers": {
            "db": {
                "image": "/opt/rootfs",
                "command": ["/bin/sleep", "30"],
                "network": "appnet",
                "restart": "on-failure"
            },
            "web": {
                "image": "/opt/rootfs",
                "command": ["/bin/server"],
                "hostname": "web-1",
                "workdir": "/srv",
                "environment": {"PORT": "80"},
                "ports": ["8080:80"],
                "network": "appnet",
                "ip": "10.0.0.10",
                "depends_on": ["db"],
                "restart": "always",
                "namespaces": {"UTS": true, "PID": true, "Mount": true, "Net": true, "IPC": true, "User": false}
            }
        },
        "networks": {
            "appnet": {"driver": "bridge", "subnet": "10.0.0.0/24", "gateway": "10.0.0.1"}
        }
    }"#;

    #[test]
    fn test_parse_deployment() -> Result<()> {
        let manager = Manager::from_json(DEPLOYMENT)?;
        let config = &manager.shared.config;

        assert_eq!(config.version, "1");
        assert_eq!(config.containers.len(), 2);

        let web = &config.containers["web"];
        assert_eq!(web.hostname, "web-1");
        assert_eq!(web.working_dir, "/srv");
        assert_eq!(web.ports, ["8080:80"]);
        assert_eq!(web.depends_on, ["db"]);
        assert_eq!(web.restart, RestartPolicy::Always);
        assert_eq!(web.ip, Some("10.0.0.10".parse()?));
        assert!(web.namespaces.unwrap().net);

        let db = &config.containers["db"];
        assert_eq!(db.restart, RestartPolicy::OnFailure);
        assert!(db.namespaces.is_none());

        let net = &config.networks["appnet"];
        assert_eq!(net.driver, NetworkMode::Bridge);
        assert_eq!(net.subnet, Some("10.0.0.0/24".parse()?));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_bad_json() {
        assert!(Manager::from_json("{ nope").is_err());
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(DEPLOYMENT.as_bytes())?;
        let manager = Manager::from_file(file.path())?;
        assert_eq!(manager.shared.config.containers.len(), 2);
        Ok(())
    }

    #[test]
    fn test_parse_port_mapping() {
        let mapping = parse_port_mapping("8080:80").unwrap();
        assert_eq!(mapping.host_port, 8080);
        assert_eq!(mapping.container_port, 80);
        assert_eq!(mapping.protocol, Protocol::Tcp);

        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("8080:http").is_err());
        assert!(parse_port_mapping("eighty:80").is_err());
        assert!(parse_port_mapping("99999:80").is_err());
    }

    #[test]
    fn test_circular_dependency_detected() -> Result<()> {
        let manager = Manager::from_json(
            r#"{
                "containers": {
                    "a": {"image": "/opt/rootfs", "command": ["/bin/true"], "depends_on": ["b"]},
                    "b": {"image": "/opt/rootfs", "command": ["/bin/true"], "depends_on": ["a"]}
                }
            }"#,
        )?;
        assert!(matches!(
            manager.start(),
            Err(KittenError::DependencyCycle)
        ));
        // no container was started
        assert!(manager.list_containers().is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_dependency_detected() -> Result<()> {
        let manager = Manager::from_json(
            r#"{
                "containers": {
                    "a": {"image": "/opt/rootfs", "command": ["/bin/true"], "depends_on": ["ghost"]}
                }
            }"#,
        )?;
        assert!(matches!(
            manager.start(),
            Err(KittenError::DependencyCycle)
        ));
        Ok(())
    }

    #[test]
    fn test_stop_order_reverses_dependencies() -> Result<()> {
        let manager = Manager::from_json(
            r#"{
                "containers": {
                    "web": {"image": "/x", "depends_on": ["app"]},
                    "app": {"image": "/x", "depends_on": ["db"]},
                    "db": {"image": "/x"}
                }
            }"#,
        )?;

        let order = manager.stop_order();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert_eq!(order.len(), 3);
        assert!(pos("web") < pos("app"));
        assert!(pos("app") < pos("db"));
        Ok(())
    }

    #[test]
    fn test_status_empty_before_start() -> Result<()> {
        let manager = Manager::from_json(r#"{"containers": {}}"#)?;
        assert!(manager.status().is_empty());
        assert!(manager.get_container("nope").is_none());
        Ok(())
    }
}
