//! IP and reachability discovery for ledger machines.
//!
//! Sources are tried in a fixed order and each one fails soft: a missing
//! answer is `None`, never an error, so the chain always runs to the end.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use pve_api::{AgentNetwork, ContainerConfig, ContainerInterfaces};

use crate::driver::STATE_FILE;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SSH_PORT: u16 = 22;

const STATE_RESOURCE_TYPES: &[&str] = &[
    "proxmox_vm_qemu",
    "proxmox_lxc",
    "proxmox_virtual_environment_vm",
    "proxmox_virtual_environment_container",
];
const STATE_IP_ATTRIBUTES: &[&str] = &["default_ipv4_address", "ipconfig0", "network"];
const INTERFACE_IP_FIELDS: &[&str] = &["inet", "ip-address", "ip_address", "ipv4"];

/// Parse an address the way every source reports it (`10.0.0.5`,
/// `10.0.0.5/24`, `ip=10.0.0.5/24`) and keep it only if it can reach a
/// guest: loopback, unspecified, `0.x` and broadcast are rejected.
pub fn usable_ipv4(raw: &str) -> Option<Ipv4Addr> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("ip=").unwrap_or(raw);
    let addr: Ipv4Addr = raw.split(['/', ',']).next()?.trim().parse().ok()?;

    if addr.is_loopback() || addr.is_unspecified() || addr.is_broadcast() || addr.octets()[0] == 0 {
        return None;
    }
    Some(addr)
}

/// Read access to the hypervisor's view of a guest's network.
#[async_trait]
pub trait GuestNetworkSource: Send + Sync + 'static {
    /// VM status (`running`, `stopped`, ...) or `None` if no such VM.
    async fn vm_status(&self, vm_id: u32) -> Option<String>;
    async fn agent_interfaces(&self, vm_id: u32) -> Option<AgentNetwork>;
    /// Container status or `None` if no such container.
    async fn container_status(&self, vm_id: u32) -> Option<String>;
    async fn container_config(&self, vm_id: u32) -> Option<ContainerConfig>;
    async fn container_interfaces(&self, vm_id: u32) -> Option<ContainerInterfaces>;
}

/// Liveness checks run once an address is known.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn ping(&self, ip: Ipv4Addr) -> bool;
    async fn ssh_open(&self, ip: Ipv4Addr) -> bool;
}

/// ICMP echo through the system `ping`, plus a raw TCP connect to port 22.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    pub ping_bin: String,
    pub ssh_port: u16,
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self {
            ping_bin: "ping".into(),
            ssh_port: SSH_PORT,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for NetworkProbe {
    async fn ping(&self, ip: Ipv4Addr) -> bool {
        let mut cmd = Command::new(&self.ping_bin);
        cmd.args(["-c", "1", "-W", "3"])
            .arg(ip.to_string())
            .kill_on_drop(true);

        match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(out)) => out.status.success(),
            Ok(Err(e)) => {
                warn!(%ip, error = %e, "ping could not run");
                false
            }
            Err(_) => false,
        }
    }

    async fn ssh_open(&self, ip: Ipv4Addr) -> bool {
        let addr = SocketAddr::from((ip, self.ssh_port));
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Which link of the chain produced the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Agent,
    Config,
    Interfaces,
    State,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub ip_address: Option<Ipv4Addr>,
    /// Guest status as reported by the source, `unknown` when unresolved.
    pub status: String,
    pub source: DiscoverySource,
}

impl Resolution {
    fn unresolved() -> Self {
        Self {
            ip_address: None,
            status: "unknown".into(),
            source: DiscoverySource::None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub machine_id: String,
    pub vm_id: u32,
    pub timestamp: DateTime<Utc>,
    pub ip_address: Option<Ipv4Addr>,
    pub status: String,
    pub ping_success: bool,
    pub ssh_available: bool,
    pub source: DiscoverySource,
}

/// Resolves a machine's address through the hypervisor and the saved
/// provisioning state, then probes it.
pub struct HealthChecker {
    source: Arc<dyn GuestNetworkSource>,
    probe: Arc<dyn ReachabilityProbe>,
    deployments_dir: PathBuf,
}

impl HealthChecker {
    pub fn new(
        source: Arc<dyn GuestNetworkSource>,
        probe: Arc<dyn ReachabilityProbe>,
        deployments_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            probe,
            deployments_dir: deployments_dir.into(),
        }
    }

    /// Resolve using `<deployments>/<machine_id>/terraform.tfstate` as the
    /// last resort.
    pub async fn resolve(&self, machine_id: &str, vm_id: u32) -> Resolution {
        let state = self.deployments_dir.join(machine_id).join(STATE_FILE);
        self.resolve_with_state(vm_id, &state).await
    }

    pub async fn resolve_with_state(&self, vm_id: u32, state_file: &Path) -> Resolution {
        if let Some(r) = self.from_agent(vm_id).await {
            return r;
        }

        if let Some(ct_status) = self.source.container_status(vm_id).await {
            if let Some(ip) = self.from_container_config(vm_id).await {
                return resolved(ip, ct_status, DiscoverySource::Config);
            }
            if let Some(ip) = self.from_container_interfaces(vm_id).await {
                return resolved(ip, ct_status, DiscoverySource::Interfaces);
            }
        }

        if let Some(ip) = ip_from_state_file(state_file, vm_id).await {
            return resolved(ip, "running".into(), DiscoverySource::State);
        }

        debug!(vm_id, "discovery chain exhausted");
        Resolution::unresolved()
    }

    pub async fn check(&self, machine_id: &str, vm_id: u32) -> HealthReport {
        let state = self.deployments_dir.join(machine_id).join(STATE_FILE);
        self.check_with_state(machine_id, vm_id, &state).await
    }

    /// Resolve, then run both probes against the address if one was found.
    pub async fn check_with_state(
        &self,
        machine_id: &str,
        vm_id: u32,
        state_file: &Path,
    ) -> HealthReport {
        let resolution = self.resolve_with_state(vm_id, state_file).await;

        let (ping_success, ssh_available) = match resolution.ip_address {
            Some(ip) => tokio::join!(self.probe.ping(ip), self.probe.ssh_open(ip)),
            None => (false, false),
        };

        info!(
            machine_id,
            vm_id,
            ip = ?resolution.ip_address,
            source = ?resolution.source,
            ping_success,
            ssh_available,
            "health check complete"
        );

        HealthReport {
            machine_id: machine_id.to_string(),
            vm_id,
            timestamp: Utc::now(),
            ip_address: resolution.ip_address,
            status: resolution.status,
            ping_success,
            ssh_available,
            source: resolution.source,
        }
    }

    async fn from_agent(&self, vm_id: u32) -> Option<Resolution> {
        let status = self.source.vm_status(vm_id).await?;
        let network = self.source.agent_interfaces(vm_id).await?;
        let ip = ip_from_agent(&network)?;
        Some(resolved(ip, status, DiscoverySource::Agent))
    }

    async fn from_container_config(&self, vm_id: u32) -> Option<Ipv4Addr> {
        let config = self.source.container_config(vm_id).await?;
        ip_from_container_config(&config)
    }

    async fn from_container_interfaces(&self, vm_id: u32) -> Option<Ipv4Addr> {
        let interfaces = self.source.container_interfaces(vm_id).await?;
        ip_from_container_interfaces(&interfaces)
    }
}

fn resolved(ip: Ipv4Addr, status: String, source: DiscoverySource) -> Resolution {
    Resolution {
        ip_address: Some(ip),
        status,
        source,
    }
}

/// First usable IPv4 on any non-loopback interface.
pub fn ip_from_agent(network: &AgentNetwork) -> Option<Ipv4Addr> {
    network
        .result
        .iter()
        .filter(|iface| iface.name != "lo")
        .flat_map(|iface| iface.ip_addresses.iter())
        .filter(|addr| addr.ip_address_type.as_deref() != Some("ipv6"))
        .find_map(|addr| usable_ipv4(&addr.ip_address))
}

/// Static `ip=` directive from any `netN` entry; `ip=dhcp` yields nothing.
pub fn ip_from_container_config(config: &ContainerConfig) -> Option<Ipv4Addr> {
    let mut keys: Vec<&String> = config.keys().filter(|k| k.starts_with("net")).collect();
    keys.sort();

    keys.into_iter()
        .filter_map(|k| config.get(k)?.as_str())
        .flat_map(|value| value.split(','))
        .filter_map(|part| part.trim().strip_prefix("ip="))
        .find_map(usable_ipv4)
}

/// Address of `eth0`, else of the first other `eth*` interface.
pub fn ip_from_container_interfaces(payload: &ContainerInterfaces) -> Option<Ipv4Addr> {
    let list = match payload {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("data").or_else(|| obj.get("result")) {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    let ifaces: Vec<&Map<String, Value>> = list.iter().filter_map(Value::as_object).collect();

    let eth0 = ifaces.iter().copied().filter(|i| iface_name(i) == "eth0");
    let other_eth = ifaces.iter().copied().filter(|i| {
        let n = iface_name(i);
        n != "eth0" && n.starts_with("eth")
    });

    eth0.chain(other_eth).find_map(interface_ip)
}

fn iface_name(iface: &Map<String, Value>) -> &str {
    iface.get("name").and_then(Value::as_str).unwrap_or_default()
}

fn interface_ip(iface: &Map<String, Value>) -> Option<Ipv4Addr> {
    let direct = INTERFACE_IP_FIELDS
        .iter()
        .filter_map(|field| iface.get(*field)?.as_str())
        .find_map(usable_ipv4);
    if direct.is_some() {
        return direct;
    }

    iface
        .get("ip-addresses")?
        .as_array()?
        .iter()
        .filter_map(|entry| match entry {
            Value::Object(obj) => obj
                .get("ip-address")
                .or_else(|| obj.get("address"))
                .and_then(Value::as_str)
                .map(str::to_string),
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .find_map(|s| usable_ipv4(&s))
}

async fn ip_from_state_file(path: &Path, vm_id: u32) -> Option<Ipv4Addr> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no state file to inspect");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(state) => ip_from_state(&state, vm_id),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "state file is not valid json");
            None
        }
    }
}

/// Address from a saved provisioning state document. Instances carrying a
/// `vmid` for a different machine are skipped, so pack members resolve to
/// their own address.
pub fn ip_from_state(state: &Value, vm_id: u32) -> Option<Ipv4Addr> {
    let resources = state.get("resources")?.as_array()?;

    resources
        .iter()
        .filter(|r| {
            r.get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| STATE_RESOURCE_TYPES.contains(&t))
        })
        .filter_map(|r| r.get("instances")?.as_array())
        .flatten()
        .filter_map(|instance| instance.get("attributes")?.as_object())
        .filter(|attrs| match attrs.get("vmid").or_else(|| attrs.get("vm_id")) {
            Some(Value::Number(n)) => n.as_u64() == Some(u64::from(vm_id)),
            Some(Value::String(s)) => s.parse::<u32>().ok() == Some(vm_id),
            _ => true,
        })
        .find_map(|attrs| {
            STATE_IP_ATTRIBUTES
                .iter()
                .filter_map(|field| attrs.get(*field))
                .find_map(ip_in_value)
        })
}

fn ip_in_value(value: &Value) -> Option<Ipv4Addr> {
    match value {
        Value::String(s) => s.split(',').find_map(usable_ipv4),
        Value::Object(obj) => obj
            .iter()
            .filter(|(k, _)| k.to_lowercase().contains("ip"))
            .find_map(|(_, v)| ip_in_value(v)),
        Value::Array(items) => items.iter().find_map(ip_in_value),
        _ => None,
    }
}
