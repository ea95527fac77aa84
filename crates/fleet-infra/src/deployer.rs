use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::allocator::{IdAllocator, InventorySource};
use crate::config::FleetConfig;
use crate::descriptor;
use crate::discovery::{GuestNetworkSource, HealthChecker, HealthReport, ReachabilityProbe};
use crate::driver::{CommandRunner, DeploymentEntry, TerraformDriver, CONFIG_FILE};
use crate::ledger::Ledger;
use crate::types::{
    DeployedMachine, FailureKind, MachineSpec, MachineStatus, ProvisioningResult, MAX_VMID, MIN_VMID,
};
use crate::{Error, Result};

/// Per-machine result of a batch deploy.
#[derive(Debug, Clone, Serialize)]
pub struct MachineOutcome {
    /// Caller-local id from the request.
    pub machine_id: String,
    pub name: String,
    pub vm_id: Option<u32>,
    #[serde(flatten)]
    pub result: ProvisioningResult,
    pub records: Vec<DeployedMachine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<MachineOutcome>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl BatchReport {
    fn from_outcomes(results: Vec<MachineOutcome>) -> Self {
        let successful = results.iter().filter(|r| r.result.success).count();
        Self {
            total: results.len(),
            failed: results.len() - successful,
            successful,
            results,
        }
    }
}

/// Orchestrates allocation, descriptor generation, the provisioning tool,
/// the ledger and discovery.
pub struct Deployer {
    config: FleetConfig,
    allocator: IdAllocator,
    driver: TerraformDriver,
    ledger: Ledger,
    health: HealthChecker,
    /// Held across allocate-then-commit of a working directory.
    alloc_lock: Mutex<()>,
    machine_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Deployer {
    pub async fn new(
        config: FleetConfig,
        inventory: Arc<dyn InventorySource>,
        guests: Arc<dyn GuestNetworkSource>,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        let deployments = config.deployments_dir();
        tokio::fs::create_dir_all(&deployments).await?;

        Ok(Self {
            allocator: IdAllocator::new(inventory, &deployments),
            driver: TerraformDriver::new(runner, &config.templates_dir, &deployments, config.unlock_grace),
            ledger: Ledger::open(config.ledger_path(), &deployments).await?,
            health: HealthChecker::new(guests, probe, &deployments),
            alloc_lock: Mutex::new(()),
            machine_locks: StdMutex::new(HashMap::new()),
            config,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Deploy each spec in turn. One machine failing never affects the
    /// others.
    pub async fn deploy_machines(&self, specs: Vec<MachineSpec>) -> BatchReport {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            results.push(self.deploy_one(spec).await);
        }

        let report = BatchReport::from_outcomes(results);
        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "batch deploy finished"
        );
        report
    }

    pub async fn deploy_one(&self, mut spec: MachineSpec) -> MachineOutcome {
        let machine_id = spec.id.clone();
        let name = spec.name.clone();

        let (vm_id, workdir) = match self.commit_workdir(&mut spec).await {
            Ok(committed) => committed,
            Err(e) => {
                warn!(machine_id = %machine_id, error = %e, "deploy rejected");
                return MachineOutcome {
                    machine_id,
                    result: ProvisioningResult::failed(
                        FailureKind::Unexpected,
                        format!("Terraform deployment error for {name}: {e}"),
                        e.to_string(),
                    ),
                    name,
                    vm_id: None,
                    records: Vec::new(),
                };
            }
        };

        let key = vm_id.to_string();
        let result = {
            let lock = self.machine_lock(&key);
            let _guard = lock.lock().await;
            self.driver.apply(&workdir, &spec.name, !spec.is_pack()).await
        };
        self.release_lock(&key);

        let mut records = Vec::new();
        if result.success {
            match self.ledger.add(&spec, &result).await {
                Ok(added) => records = added,
                Err(e) => error!(vm_id, error = %e, "deployed but failed to record in ledger"),
            }
        }

        MachineOutcome {
            machine_id,
            name,
            vm_id: Some(vm_id),
            result,
            records,
        }
    }

    /// Pick the id, then lay out its working directory before any other
    /// request can allocate.
    async fn commit_workdir(&self, spec: &mut MachineSpec) -> Result<(u32, PathBuf)> {
        let count = spec.member_count();
        let _guard = self.alloc_lock.lock().await;

        let vm_id = match spec.advanced.requested_vmid() {
            Some(requested) => {
                check_requested(requested, count)?;
                requested
            }
            None => {
                if let Some(raw) = &spec.advanced.vmid {
                    warn!(machine_id = %spec.id, vmid = %raw, "ignoring non-numeric vmid");
                }
                self.allocator.allocate_range(count).await?
            }
        };

        let workdir = self.config.deployments_dir().join(vm_id.to_string());
        if tokio::fs::try_exists(workdir.join(CONFIG_FILE)).await.unwrap_or(false) {
            return Err(Error::InvalidSpec(format!(
                "working directory for {vm_id} is already in use"
            )));
        }

        spec.vm_id = Some(vm_id);
        let vars = descriptor::generate(spec, vm_id, &self.config.proxmox);
        self.driver.prepare(spec, &vars, &workdir).await?;

        info!(machine_id = %spec.id, vm_id, count, "working directory committed");
        Ok((vm_id, workdir))
    }

    /// Tear down the guests behind ledger id `id` (or a bare working
    /// directory of that name) and forget them. Destroying any member of a
    /// pack removes the whole pack.
    pub async fn destroy(&self, id: &str) -> Result<ProvisioningResult> {
        if !is_plain_id(id) {
            return Err(Error::InvalidSpec(format!("invalid machine id {id:?}")));
        }

        let record = self.ledger.get(id).await?;
        let workdir = match record.as_ref().and_then(DeployedMachine::workdir) {
            Some(dir) => dir,
            None => self.config.deployments_dir().join(id),
        };

        if record.is_none() && !tokio::fs::try_exists(&workdir).await.unwrap_or(false) {
            return Err(Error::NotFound(id.to_string()));
        }

        let key = lock_key(&workdir, id);
        let result = {
            let lock = self.machine_lock(&key);
            let _guard = lock.lock().await;
            self.driver.destroy(&workdir, id).await
        };
        self.release_lock(&key);

        if result.success {
            match record.as_ref().and_then(|r| r.pack_id.as_deref()) {
                Some(pack_id) => {
                    self.ledger.remove_pack(pack_id).await?;
                }
                None => {
                    self.ledger.remove(id).await?;
                }
            }
            info!(id, "machine destroyed");
        }
        Ok(result)
    }

    /// Resolve and probe a ledger machine, writing status and address back.
    pub async fn health_check(&self, id: &str) -> Result<HealthReport> {
        let record = self
            .ledger
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let vm_id = record
            .vm_id()
            .or(record.config.vm_id)
            .ok_or_else(|| Error::InvalidSpec(format!("machine {id} has no numeric id")))?;

        let report = self
            .health
            .check_with_state(id, vm_id, &record.terraform_state_path)
            .await;

        let ip = report.ip_address.map(|ip| ip.to_string());
        self.ledger
            .update_status(id, MachineStatus::from_guest_status(&report.status), ip.as_deref())
            .await?;

        Ok(report)
    }

    pub async fn list(&self) -> Result<Vec<DeployedMachine>> {
        self.ledger.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeployedMachine>> {
        self.ledger.get(id).await
    }

    pub async fn list_deployments(&self) -> Result<Vec<DeploymentEntry>> {
        TerraformDriver::list_deployments(&self.config.deployments_dir()).await
    }

    fn machine_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .machine_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Forget the lock for `key` once no task holds or awaits it.
    fn release_lock(&self, key: &str) {
        let mut locks = self
            .machine_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.machine_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// A ledger id or working-directory name: exactly one normal path component.
fn is_plain_id(id: &str) -> bool {
    let mut parts = Path::new(id).components();
    matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None))
}

fn check_requested(vm_id: u32, count: u32) -> Result<()> {
    let last = u64::from(vm_id) + u64::from(count) - 1;
    if vm_id < MIN_VMID || last > u64::from(MAX_VMID) {
        return Err(Error::InvalidSpec(format!(
            "vmid {vm_id} (block of {count}) outside {MIN_VMID}..={MAX_VMID}"
        )));
    }
    Ok(())
}

fn lock_key(workdir: &Path, fallback: &str) -> String {
    workdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}
