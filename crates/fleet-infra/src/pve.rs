use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use pve_api::{
    AgentNetwork, ContainerConfig, ContainerInterfaces, GuestKind, PveClient,
};

use crate::allocator::InventorySource;
use crate::config::ProxmoxConnection;
use crate::discovery::GuestNetworkSource;
use crate::Result;

/// Proxmox-backed inventory and guest network lookups for one node.
///
/// Every lookup is soft: API failures are logged and surface as `None`.
pub struct PveInventory {
    client: PveClient,
    node: String,
}

impl PveInventory {
    pub fn new(client: PveClient, node: impl Into<String>) -> Self {
        Self {
            client,
            node: node.into(),
        }
    }

    pub fn from_config(conn: &ProxmoxConnection) -> Result<Self> {
        let client = PveClient::new(
            &conn.server,
            conn.port,
            conn.api_token()?,
            conn.accept_invalid_certs,
        )?;
        Ok(Self::new(client, conn.node.clone()))
    }

    async fn status(&self, kind: GuestKind, vm_id: u32) -> Option<String> {
        match self.client.guest_status(&self.node, kind, vm_id).await {
            Ok(s) => Some(s.status),
            Err(e) => {
                debug!(vm_id, kind = kind.as_str(), error = %e, "guest status unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl InventorySource for PveInventory {
    async fn existing_vmids(&self) -> Option<HashSet<u32>> {
        let nodes = match self.client.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "failed to list proxmox nodes");
                return None;
            }
        };

        let mut ids = HashSet::new();
        for node in &nodes {
            for kind in [GuestKind::Qemu, GuestKind::Lxc] {
                match self.client.list_guests(&node.node, kind).await {
                    Ok(guests) => ids.extend(guests.iter().map(|g| g.vmid)),
                    Err(e) => warn!(
                        node = %node.node,
                        kind = kind.as_str(),
                        error = %e,
                        "failed to list guests"
                    ),
                }
            }
        }

        debug!(nodes = nodes.len(), ids = ids.len(), "read hypervisor inventory");
        Some(ids)
    }
}

#[async_trait]
impl GuestNetworkSource for PveInventory {
    async fn vm_status(&self, vm_id: u32) -> Option<String> {
        self.status(GuestKind::Qemu, vm_id).await
    }

    async fn agent_interfaces(&self, vm_id: u32) -> Option<AgentNetwork> {
        match self.client.agent_network_interfaces(&self.node, vm_id).await {
            Ok(net) => Some(net),
            Err(e) => {
                debug!(vm_id, error = %e, "guest agent did not answer");
                None
            }
        }
    }

    async fn container_status(&self, vm_id: u32) -> Option<String> {
        self.status(GuestKind::Lxc, vm_id).await
    }

    async fn container_config(&self, vm_id: u32) -> Option<ContainerConfig> {
        match self.client.container_config(&self.node, vm_id).await {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(vm_id, error = %e, "failed to read container config");
                None
            }
        }
    }

    async fn container_interfaces(&self, vm_id: u32) -> Option<ContainerInterfaces> {
        match self.client.container_interfaces(&self.node, vm_id).await {
            Ok(ifaces) => Some(ifaces),
            Err(e) => {
                warn!(vm_id, error = %e, "failed to read container interfaces");
                None
            }
        }
    }
}
