//! Descriptor (`terraform.tfvars`) generation.
//!
//! [`generate`] is a pure function of the spec, the allocated id and the
//! connection parameters; the rendered variable order is stable.

use std::fmt::Write as _;

use serde_json::Value;

use crate::config::ProxmoxConnection;
use crate::types::{BaseType, MachineSpec, PerfTier};

const MAX_NAME_LEN: usize = 64;
const NETWORK_BRIDGE: &str = "vmbr0";
const NETWORK_TAG: i64 = 10;
const GATEWAY: &str = "192.168.1.1";
const NAMESERVER: &str = "8.8.8.8";

const WINDOWS_TEMPLATES: &[(&str, &str)] = &[
    ("2016", "windows-server-2016-template"),
    ("2019", "windows-server-2019-template"),
    ("2022", "windows-server-2022-template"),
];
const NEWEST_WINDOWS_TEMPLATE: &str = "windows-server-2022-template";

/// A descriptor value. The shapes here are the only ones rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum TfValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl TfValue {
    /// Total conversion from arbitrary JSON; objects, null and lists holding
    /// non-scalars have no descriptor form and yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            Value::Null | Value::Object(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Str(s) => quote(s),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::List(items) => {
                let inner: Vec<String> = items.iter().map(|s| quote(s)).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }
}

impl From<&str> for TfValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for TfValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<u32> for TfValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for TfValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

/// HCL string literal; `${` and `%{` are doubled so values never open a
/// template sequence.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Ordered key/value variables; setting an existing key replaces it in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableMap {
    entries: Vec<(String, TfValue)>,
}

impl VariableMap {
    pub fn set(&mut self, key: &str, value: impl Into<TfValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Set from JSON, silently skipping shapes without a descriptor form.
    pub fn set_json(&mut self, key: &str, value: &Value) {
        if let Some(v) = TfValue::from_json(value) {
            self.set(key, v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&TfValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `key = value` lines in insertion order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{key} = {}", value.render());
        }
        out
    }
}

/// Reduce a user-supplied name to a hostname-safe identifier: at most 64
/// characters of `[A-Za-z0-9-]`, starting alphanumeric, never empty.
pub fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    if name.is_empty() {
        return "vm".into();
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name.insert_str(0, "vm-");
    }
    name.truncate(MAX_NAME_LEN);
    name
}

fn windows_template(os_version: Option<&str>) -> &'static str {
    os_version
        .and_then(|v| WINDOWS_TEMPLATES.iter().find(|(k, _)| *k == v))
        .map(|(_, t)| *t)
        .unwrap_or(NEWEST_WINDOWS_TEMPLATE)
}

/// Build the descriptor variables for `spec`, provisioned as `vm_id` (the
/// block start for packs).
pub fn generate(spec: &MachineSpec, vm_id: u32, conn: &ProxmoxConnection) -> VariableMap {
    let adv = &spec.advanced;
    let name = sanitize_name(&spec.name);

    let mut vars = VariableMap::default();
    vars.set("vm_name", name.as_str());
    vars.set("vm_id", vm_id);
    vars.set("proxmox_server", conn.server.as_str());
    vars.set("proxmox_token", conn.token.as_str());
    vars.set("proxmox_node", conn.node.as_str());

    match spec.base_type {
        BaseType::LinuxServer => {
            let (cores, memory, disk) = PerfTier::from_label(adv.perf.as_deref()).resources();
            let ssh_key = adv.ssh_key.clone().unwrap_or(Value::String(String::new()));

            vars.set("template_name", adv.os_version.clone().unwrap_or_default());
            vars.set("cores", cores);
            vars.set("memory", memory);
            vars.set("disk_size", disk);
            vars.set("username", adv.username.clone().unwrap_or_else(|| "user".into()));
            vars.set_json("ssh_keys", &ssh_key);
            vars.set_json("ssh_key", &ssh_key);
            vars.set("network_bridge", NETWORK_BRIDGE);
            vars.set("network_tag", NETWORK_TAG);

            if adv.is_static_ip() {
                vars.set("ip_address", adv.ip_address.clone().unwrap_or_default());
                vars.set("subnet_mask", adv.subnet_mask.clone().unwrap_or_else(|| "24".into()));
                vars.set("gateway", GATEWAY);
                vars.set("nameserver", NAMESERVER);
            } else {
                vars.set("network_config", "dhcp");
                vars.set("nameserver", NAMESERVER);
            }
        }
        BaseType::WindowsServer => {
            let (cores, memory, disk) = PerfTier::from_label(adv.perf.as_deref()).resources();

            vars.set("template_name", windows_template(adv.os_version.as_deref()));
            vars.set("cores", cores);
            vars.set("memory", memory);
            vars.set("disk_size", disk);
            vars.set("network_bridge", NETWORK_BRIDGE);
            vars.set("network_tag", NETWORK_TAG);
            vars.set("nameserver", NAMESERVER);
        }
        BaseType::VmPack => {
            let os_version = spec
                .group
                .as_ref()
                .and_then(|g| g.os_version.clone())
                .unwrap_or_default();

            vars.set("template_name", os_version);
            vars.set("vm_count", spec.member_count());
            vars.set("base_name", name.as_str());
            vars.set("start_vmid", vm_id);
            vars.set("cores", 2u32);
            vars.set("memory", 2048u32);
            vars.set("disk_size", 20u32);
            vars.set("network_bridge", NETWORK_BRIDGE);
            vars.set("network_tag", NETWORK_TAG);
            vars.set("gateway", GATEWAY);
            vars.set("nameserver", NAMESERVER);
            vars.set("username", "user");
            vars.set("ssh_keys", "");
        }
    }

    vars
}
