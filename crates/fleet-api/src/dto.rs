use serde::{Deserialize, Serialize};

use fleet_infra::types::{DeployedMachine, MachineSpec};

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub machines: Vec<MachineSpec>,
}

#[derive(Debug, Serialize)]
pub struct MachineList {
    pub machines: Vec<DeployedMachine>,
    pub total: usize,
}

impl From<Vec<DeployedMachine>> for MachineList {
    fn from(machines: Vec<DeployedMachine>) -> Self {
        Self {
            total: machines.len(),
            machines,
        }
    }
}
