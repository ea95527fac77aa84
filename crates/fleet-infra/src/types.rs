use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Lowest id handed out by the allocator.
pub const MIN_VMID: u32 = 5000;
/// Highest id Proxmox accepts.
pub const MAX_VMID: u32 = 999_999;

// ── Request ─────────────────────────────────────────────────────────

/// Abstract machine request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Caller-local correlation id.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    pub base_type: BaseType,
    #[serde(default)]
    pub advanced: AdvancedOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<PackGroup>,
    /// Authoritative numeric id, filled in once provisioning has run.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "vm_id")]
    pub vm_id: Option<u32>,
}

impl MachineSpec {
    pub fn is_pack(&self) -> bool {
        self.base_type == BaseType::VmPack
    }

    /// Number of guests this spec provisions.
    pub fn member_count(&self) -> u32 {
        match (&self.base_type, &self.group) {
            (BaseType::VmPack, Some(group)) => group.count.max(1),
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseType {
    #[serde(rename = "linuxServer", alias = "linux-server")]
    LinuxServer,
    #[serde(rename = "windowsServer", alias = "windows-server", alias = "windows10")]
    WindowsServer,
    #[serde(rename = "vmPack", alias = "vm-pack")]
    VmPack,
}

impl BaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LinuxServer => "linuxServer",
            Self::WindowsServer => "windowsServer",
            Self::VmPack => "vmPack",
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form tuning knobs from the request's `advanced` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<String>,
    /// Desired numeric id; callers send it as a number or a numeric string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<Value>,
    /// `vm` or `ct` for Linux servers.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub guest_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, rename = "sshKey", skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AdvancedOptions {
    /// The caller-requested id, if it is a usable integer.
    pub fn requested_vmid(&self) -> Option<u32> {
        match self.vmid.as_ref()? {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_static_ip(&self) -> bool {
        self.ip_mode.as_deref() == Some("static")
    }

    pub fn is_container(&self) -> bool {
        self.guest_type.as_deref() == Some("ct")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackGroup {
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

fn default_count() -> u32 {
    1
}

/// Performance tier to (cores, memory MB, disk GB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfTier {
    Low,
    Medium,
    High,
}

impl PerfTier {
    /// Unknown or missing labels fall back to `Medium`.
    pub fn from_label(label: Option<&str>) -> Self {
        match label {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            _ => Self::Medium,
        }
    }

    pub fn resources(&self) -> (u32, u32, u32) {
        match self {
            Self::Low => (1, 1024, 20),
            Self::Medium => (2, 2048, 40),
            Self::High => (4, 4096, 80),
        }
    }
}

/// Template family directory under the templates root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    LinuxVm,
    LinuxCt,
    WindowsVm,
    VmPack,
}

impl TemplateKind {
    pub fn for_spec(spec: &MachineSpec) -> Self {
        match spec.base_type {
            BaseType::LinuxServer if spec.advanced.is_container() => Self::LinuxCt,
            BaseType::LinuxServer => Self::LinuxVm,
            BaseType::WindowsServer => Self::WindowsVm,
            BaseType::VmPack => Self::VmPack,
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::LinuxVm => "linux-vm",
            Self::LinuxCt => "linux-ct",
            Self::WindowsVm => "windows-vm",
            Self::VmPack => "vm-pack",
        }
    }
}

// ── Provisioning outcome ────────────────────────────────────────────

/// Failure class of a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Init,
    Plan,
    Apply,
    Destroy,
    Timeout,
    Unlock,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub success: bool,
    pub message: String,
    /// Cleaned console output (stderr of the failing step on error).
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DeploymentSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

impl ProvisioningResult {
    pub fn failed(kind: FailureKind, message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            output: output.into(),
            summary: None,
            failure: Some(kind),
            workdir: None,
        }
    }
}

/// Facts scraped from the tool's console output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub machine_name: String,
    pub status: String,
    pub resources_created: u32,
    pub vm_ids: Vec<u32>,
    pub vm_names: Vec<String>,
    pub vm_ips: Vec<String>,
    pub vm_macs: Vec<String>,
    pub ssh_connections: Vec<SshConnection>,
}

impl DeploymentSummary {
    /// Status text only, every list empty.
    pub fn minimal(machine_name: &str) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            status: "Successfully deployed".into(),
            ..Default::default()
        }
    }

    /// One entry per parsed id, with whatever name/ip/mac lines up with it.
    pub fn machines(&self) -> Vec<MachineFacts> {
        self.vm_ids
            .iter()
            .enumerate()
            .map(|(i, id)| MachineFacts {
                id: *id,
                name: self.vm_names.get(i).cloned(),
                ip: self.vm_ips.get(i).cloned(),
                mac: self.vm_macs.get(i).cloned(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnection {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineFacts {
    pub id: u32,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub mac: Option<String>,
}

// ── Ledger ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Deployed,
    Running,
    Unknown,
    Error,
}

impl MachineStatus {
    /// Map a hypervisor-reported guest status onto the ledger vocabulary.
    pub fn from_guest_status(status: &str) -> Self {
        match status {
            "running" => Self::Running,
            _ => Self::Unknown,
        }
    }
}

/// One machine in the deployment ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedMachine {
    pub id: String,
    pub name: String,
    pub base_type: BaseType,
    pub deployment_time: DateTime<Utc>,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    pub status: MachineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub terraform_state_path: PathBuf,
    pub config: MachineSpec,
    pub deployment_result: ProvisioningResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
}

impl DeployedMachine {
    pub fn vm_id(&self) -> Option<u32> {
        self.id.parse().ok()
    }

    /// Working directory holding this machine's state file.
    pub fn workdir(&self) -> Option<PathBuf> {
        self.terraform_state_path.parent().map(PathBuf::from)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
