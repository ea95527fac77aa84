pub mod allocator;
pub mod config;
pub mod deployer;
pub mod descriptor;
pub mod discovery;
pub mod driver;
pub mod ledger;
pub mod output;
pub mod pve;
pub mod types;

use std::sync::Arc;

pub use config::{FleetConfig, ProxmoxConnection};
pub use deployer::{BatchReport, Deployer, MachineOutcome};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pve api error: {0}")]
    Pve(#[from] pve_api::Error),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no free vmid for a block of {count} (last candidate {candidate})")]
    AllocationExhausted { count: u32, candidate: u64 },

    #[error("invalid machine spec: {0}")]
    InvalidSpec(String),

    #[error("machine not found: {0}")]
    NotFound(String),

    #[error("template directory not found: {0}")]
    TemplateMissing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire the production deployer: Proxmox-backed inventory and discovery,
/// the Terraform CLI runner and the on-disk ledger.
///
/// Fails on configuration problems (bad token, unusable TLS setup) or when
/// the data directory cannot be initialized.
pub async fn build_deployer(config: FleetConfig) -> Result<Deployer> {
    if config.proxmox.accept_invalid_certs {
        tracing::warn!(
            server = %config.proxmox.server,
            "TLS verification disabled for the Proxmox API"
        );
    }

    let pve = Arc::new(pve::PveInventory::from_config(&config.proxmox)?);
    let runner = Arc::new(driver::TerraformCli::new(config.terraform_bin.clone()));
    let probe = Arc::new(discovery::NetworkProbe::default());

    tracing::info!(
        data_dir = %config.data_dir.display(),
        templates = %config.templates_dir.display(),
        node = %config.proxmox.node,
        "provisioning subsystem ready"
    );

    Deployer::new(config, pve.clone(), pve, runner, probe).await
}
