//! iptables NAT management.
//!
//! Two rule families: the per-bridge scaffolding (MASQUERADE for the
//! fixed container subnet plus FORWARD accepts on the bridge) and the
//! per-container port forwards (DNAT on PREROUTING with a matching
//! MASQUERADE for return traffic). Rules are driven through the
//! `iptables` binary; additions are made idempotent with a `-C` probe
//! first, and removals during cleanup swallow every error.

use std::net::Ipv4Addr;
use std::process::Command;

use super::{NetError, Result};
use crate::config::PortMapping;

/// Source range of the bridge MASQUERADE rule. The runtime's address
/// family is fixed IPv4/24.
const NAT_SOURCE_SUBNET: &str = "10.0.0.0/24";

fn run_iptables(args: &[&str]) -> Result<()> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|err| NetError::Firewall(format!("failed to run iptables: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetError::Firewall(format!(
            "iptables {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(())
}

/// Appends a rule unless an identical one is already installed.
fn ensure_rule(args: &[&str]) -> Result<()> {
    let check: Vec<&str> = args
        .iter()
        .map(|arg| if *arg == "-A" { "-C" } else { *arg })
        .collect();
    if run_iptables(&check).is_ok() {
        return Ok(());
    }
    run_iptables(args)
}

/// Installs the NAT scaffolding for a bridge: source MASQUERADE for
/// the fixed container subnet and ACCEPTs for traffic entering and
/// leaving the bridge.
pub fn setup_bridge_nat(bridge: &str) -> Result<()> {
    ensure_rule(&[
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "-s",
        NAT_SOURCE_SUBNET,
        "-j",
        "MASQUERADE",
    ])?;
    ensure_rule(&["-A", "FORWARD", "-i", bridge, "-j", "ACCEPT"])?;
    ensure_rule(&["-A", "FORWARD", "-o", bridge, "-j", "ACCEPT"])?;

    tracing::debug!(bridge, "installed bridge NAT rules");
    Ok(())
}

/// Removes the bridge NAT scaffolding. Cleanup never fails.
pub fn cleanup_bridge_nat(bridge: &str) {
    let _ = run_iptables(&[
        "-t",
        "nat",
        "-D",
        "POSTROUTING",
        "-s",
        NAT_SOURCE_SUBNET,
        "-j",
        "MASQUERADE",
    ]);
    let _ = run_iptables(&["-D", "FORWARD", "-i", bridge, "-j", "ACCEPT"]);
    let _ = run_iptables(&["-D", "FORWARD", "-o", bridge, "-j", "ACCEPT"]);
}

/// Installs the two rules backing one port mapping: the DNAT from the
/// host port to `container_ip:container_port` and the MASQUERADE for
/// the return path.
pub fn add_port_forward(mapping: &PortMapping, container_ip: Ipv4Addr) -> Result<()> {
    let proto = mapping.protocol.as_str();
    let host_port = mapping.host_port.to_string();
    let container_port = mapping.container_port.to_string();
    let destination = format!("{}:{}", container_ip, mapping.container_port);
    let container_ip = container_ip.to_string();

    run_iptables(&[
        "-t",
        "nat",
        "-A",
        "PREROUTING",
        "-p",
        proto,
        "--dport",
        &host_port,
        "-j",
        "DNAT",
        "--to-destination",
        &destination,
    ])?;
    run_iptables(&[
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "-p",
        proto,
        "-d",
        &container_ip,
        "--dport",
        &container_port,
        "-j",
        "MASQUERADE",
    ])?;

    tracing::debug!(
        host_port = mapping.host_port,
        container = %destination,
        proto,
        "added port forward"
    );
    Ok(())
}

/// Removes the two rules of one port mapping. Cleanup never fails.
pub fn remove_port_forward(mapping: &PortMapping, container_ip: Ipv4Addr) {
    let proto = mapping.protocol.as_str();
    let host_port = mapping.host_port.to_string();
    let container_port = mapping.container_port.to_string();
    let destination = format!("{}:{}", container_ip, mapping.container_port);
    let container_ip = container_ip.to_string();

    let _ = run_iptables(&[
        "-t",
        "nat",
        "-D",
        "PREROUTING",
        "-p",
        proto,
        "--dport",
        &host_port,
        "-j",
        "DNAT",
        "--to-destination",
        &destination,
    ]);
    let _ = run_iptables(&[
        "-t",
        "nat",
        "-D",
        "POSTROUTING",
        "-p",
        proto,
        "-d",
        &container_ip,
        "--dport",
        &container_port,
        "-j",
        "MASQUERADE",
    ]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use nix::unistd::geteuid;
    use serial_test::serial;

    fn mapping() -> PortMapping {
        PortMapping {
            host_port: 18080,
            container_port: 80,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    #[serial]
    fn test_port_forward_round_trip() {
        if !geteuid().is_root() {
            eprintln!("skipping test: requires root privileges");
            return;
        }

        let ip: Ipv4Addr = "10.0.0.9".parse().unwrap();
        add_port_forward(&mapping(), ip).unwrap();

        let rules = Command::new("iptables")
            .args(["-t", "nat", "-S"])
            .output()
            .unwrap();
        let rules = String::from_utf8_lossy(&rules.stdout).to_string();
        assert!(rules.contains("--dport 18080"));
        assert!(rules.contains("10.0.0.9:80"));

        remove_port_forward(&mapping(), ip);
        let rules = Command::new("iptables")
            .args(["-t", "nat", "-S"])
            .output()
            .unwrap();
        let rules = String::from_utf8_lossy(&rules.stdout).to_string();
        assert!(!rules.contains("10.0.0.9:80"));
    }

    #[test]
    fn test_remove_missing_rule_is_silent() {
        // removal swallows errors even without privileges
        remove_port_forward(&mapping(), "10.255.0.9".parse().unwrap());
    }
}
