use std::env;
use std::path::PathBuf;
use std::time::Duration;

use pve_api::ApiToken;

use crate::{Error, Result};

/// Connection parameters for the Proxmox host the descriptors target.
#[derive(Debug, Clone)]
pub struct ProxmoxConnection {
    pub server: String,
    pub port: Option<u16>,
    /// Raw `user@realm!name=secret` token, as written into descriptors.
    pub token: String,
    pub node: String,
    pub accept_invalid_certs: bool,
}

impl ProxmoxConnection {
    pub fn api_token(&self) -> Result<ApiToken> {
        self.token
            .parse()
            .map_err(|e: pve_api::Error| Error::Config(e.to_string()))
    }
}

/// Runtime configuration of the provisioning subsystem.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub proxmox: ProxmoxConnection,
    /// Root holding `deployments/` and the ledger file.
    pub data_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub terraform_bin: String,
    /// Wait before forcing a state unlock; zero unlocks immediately.
    pub unlock_grace: Duration,
}

impl FleetConfig {
    /// Load from env vars:
    ///
    /// - `PROXMOX_SERVER`, `PVEAPITOKEN`, `NODE` (required)
    /// - `PROXMOX_PORT` (default: 8006)
    /// - `PVE_TLS_INSECURE` (default: false)
    /// - `FLEET_DATA_DIR` (default: `.`)
    /// - `FLEET_TEMPLATES_DIR` (default: `<data>/terraform-templates`)
    /// - `TERRAFORM_BIN` (default: `terraform`)
    /// - `FLEET_UNLOCK_GRACE_SECS` (default: 0)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let server = required("PROXMOX_SERVER")?;
        let token = required("PVEAPITOKEN")?;
        let node = required("NODE")?;

        let port = match env::var("PROXMOX_PORT") {
            Ok(raw) => Some(
                raw.parse::<u16>()
                    .map_err(|_| Error::Config(format!("PROXMOX_PORT is not a port: {raw}")))?,
            ),
            Err(_) => None,
        };

        let accept_invalid_certs = env::var("PVE_TLS_INSECURE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let data_dir = PathBuf::from(env::var("FLEET_DATA_DIR").unwrap_or_else(|_| ".".into()));
        let templates_dir = env::var("FLEET_TEMPLATES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("terraform-templates"));

        let unlock_grace = env::var("FLEET_UNLOCK_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);

        let config = Self {
            proxmox: ProxmoxConnection {
                server,
                port,
                token,
                node,
                accept_invalid_certs,
            },
            data_dir,
            templates_dir,
            terraform_bin: env::var("TERRAFORM_BIN").unwrap_or_else(|_| "terraform".into()),
            unlock_grace,
        };

        // Surface a malformed token at startup rather than on first use.
        config.proxmox.api_token()?;
        Ok(config)
    }

    pub fn deployments_dir(&self) -> PathBuf {
        self.data_dir.join("deployments")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("deployed_machines.json")
    }
}

fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::MissingEnv(key.into())),
    }
}
