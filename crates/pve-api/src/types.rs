use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

// ── Envelope ─────────────────────────────────────────────────────────

/// Every `/api2/json` response wraps its payload in `{ "data": ... }`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

// ── Nodes & guests ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NodeListItem {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Entry from `/nodes/{node}/qemu` or `/nodes/{node}/lxc`.
///
/// The container listing reports `vmid` as a string on some releases, so
/// both shapes are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct GuestListItem {
    #[serde(deserialize_with = "vmid_from_any")]
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// `/nodes/{node}/{qemu|lxc}/{vmid}/status/current`.
#[derive(Debug, Clone, Deserialize)]
pub struct GuestStatus {
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uptime: Option<u64>,
}

fn unknown_status() -> String {
    "unknown".into()
}

// ── Guest agent ──────────────────────────────────────────────────────

/// `/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentNetwork {
    #[serde(default)]
    pub result: Vec<AgentInterface>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterface {
    pub name: String,
    #[serde(rename = "hardware-address", default)]
    pub hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type", default)]
    pub ip_address_type: Option<String>,
    #[serde(default)]
    pub prefix: Option<u8>,
}

// ── Containers ───────────────────────────────────────────────────────

/// Container config is a flat key/value map (`net0`, `hostname`, ...).
pub type ContainerConfig = Map<String, Value>;

/// The container interfaces payload differs between releases (plain list,
/// or wrapped once more in `data`/`result`), so it is left untyped.
pub type ContainerInterfaces = Value;

fn vmid_from_any<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("vmid out of range: {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid vmid: {s}"))),
        other => Err(serde::de::Error::custom(format!("invalid vmid: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_list_accepts_numeric_and_string_vmids() {
        let raw = r#"{"data":[{"vmid":5000,"name":"a"},{"vmid":"5001","status":"running"}]}"#;
        let parsed: Envelope<Vec<GuestListItem>> = serde_json::from_str(raw).unwrap();
        let ids: Vec<u32> = parsed.data.iter().map(|g| g.vmid).collect();
        assert_eq!(ids, vec![5000, 5001]);
    }

    #[test]
    fn guest_list_rejects_garbage_vmid() {
        let raw = r#"{"data":[{"vmid":"abc"}]}"#;
        assert!(serde_json::from_str::<Envelope<Vec<GuestListItem>>>(raw).is_err());
    }

    #[test]
    fn agent_network_parses_hyphenated_fields() {
        let raw = r#"{"data":{"result":[
            {"name":"lo","ip-addresses":[{"ip-address":"127.0.0.1","ip-address-type":"ipv4","prefix":8}]},
            {"name":"eth0","hardware-address":"bc:24:11:00:00:01",
             "ip-addresses":[{"ip-address":"10.0.0.7","ip-address-type":"ipv4","prefix":24}]}
        ]}}"#;
        let parsed: Envelope<AgentNetwork> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.result.len(), 2);
        assert_eq!(parsed.data.result[1].ip_addresses[0].ip_address, "10.0.0.7");
    }

    #[test]
    fn status_defaults_to_unknown() {
        let parsed: Envelope<GuestStatus> = serde_json::from_str(r#"{"data":{}}"#).unwrap();
        assert_eq!(parsed.data.status, "unknown");
    }
}
