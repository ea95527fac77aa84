//! Persistent record of successfully deployed machines.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::driver::STATE_FILE;
use crate::types::{DeployedMachine, MachineSpec, MachineStatus, ProvisioningResult};
use crate::Result;

const UNKNOWN_IP: &str = "Unknown";
const DHCP_IP: &str = "dhcp";

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    machines: Vec<DeployedMachine>,
}

/// JSON-file ledger keyed by numeric id.
///
/// Mutations are serialized through one writer lock and land on disk via
/// write-to-temp-then-rename, so readers never see a torn file.
pub struct Ledger {
    path: PathBuf,
    deployments_dir: PathBuf,
    writer: Mutex<()>,
}

impl Ledger {
    /// Open the ledger at `path`, creating an empty one on first use.
    pub async fn open(path: impl Into<PathBuf>, deployments_dir: impl Into<PathBuf>) -> Result<Self> {
        let ledger = Self {
            path: path.into(),
            deployments_dir: deployments_dir.into(),
            writer: Mutex::new(()),
        };

        if !tokio::fs::try_exists(&ledger.path).await.unwrap_or(false) {
            ledger.save(&LedgerFile::default()).await?;
            info!(path = %ledger.path.display(), "created empty ledger");
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a successful provisioning run. A pack yields one record per
    /// parsed id; anything else yields exactly one record. Existing records
    /// with the same id are replaced.
    pub async fn add(&self, spec: &MachineSpec, result: &ProvisioningResult) -> Result<Vec<DeployedMachine>> {
        let records = if spec.is_pack() {
            self.pack_records(spec, result)
        } else {
            vec![self.single_record(spec, result)]
        };

        let _guard = self.writer.lock().await;
        let mut file = self.load().await?;
        for record in &records {
            file.machines.retain(|m| m.id != record.id);
            file.machines.push(record.clone());
            info!(id = %record.id, name = %record.name, "recorded deployed machine");
        }
        self.save(&file).await?;

        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DeployedMachine>> {
        Ok(self.load().await?.machines.into_iter().find(|m| m.id == id))
    }

    pub async fn list(&self) -> Result<Vec<DeployedMachine>> {
        Ok(self.load().await?.machines)
    }

    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }

    pub async fn state_path(&self, id: &str) -> Result<Option<PathBuf>> {
        Ok(self.get(id).await?.map(|m| m.terraform_state_path))
    }

    /// Set status and stamp `last_updated`; `ip` replaces the address when
    /// given. Returns whether the record existed.
    pub async fn update_status(&self, id: &str, status: MachineStatus, ip: Option<&str>) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let mut file = self.load().await?;

        let Some(machine) = file.machines.iter_mut().find(|m| m.id == id) else {
            debug!(id, "status update for unknown machine");
            return Ok(false);
        };
        machine.status = status;
        machine.last_updated = Some(Utc::now());
        if let Some(ip) = ip {
            machine.ip_address = strip_prefix_len(ip);
        }

        self.save(&file).await?;
        info!(id, ?status, "updated machine status");
        Ok(true)
    }

    /// Returns whether a record was removed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.remove_where(|m| m.id == id).await
    }

    /// Drop every member of a pack. Returns the number removed.
    pub async fn remove_pack(&self, pack_id: &str) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let mut file = self.load().await?;
        let before = file.machines.len();
        file.machines.retain(|m| m.pack_id.as_deref() != Some(pack_id));
        let removed = before - file.machines.len();
        if removed > 0 {
            self.save(&file).await?;
            info!(pack_id, removed, "removed pack from ledger");
        }
        Ok(removed)
    }

    async fn remove_where(&self, pred: impl Fn(&DeployedMachine) -> bool) -> Result<bool> {
        let _guard = self.writer.lock().await;
        let mut file = self.load().await?;
        let before = file.machines.len();
        file.machines.retain(|m| !pred(m));
        let removed = file.machines.len() != before;
        if removed {
            self.save(&file).await?;
        }
        Ok(removed)
    }

    fn state_file_for(&self, result: &ProvisioningResult, fallback_id: &str) -> PathBuf {
        result
            .workdir
            .clone()
            .unwrap_or_else(|| self.deployments_dir.join(fallback_id))
            .join(STATE_FILE)
    }

    fn pack_records(&self, spec: &MachineSpec, result: &ProvisioningResult) -> Vec<DeployedMachine> {
        let Some(summary) = &result.summary else {
            return Vec::new();
        };
        let state = self.state_file_for(result, &spec.id);
        let now = Utc::now();

        summary
            .machines()
            .into_iter()
            .enumerate()
            .map(|(i, facts)| {
                let name = facts
                    .name
                    .unwrap_or_else(|| format!("{}-{}", spec.name, i + 1));
                let mut config = spec.clone();
                config.id = facts.id.to_string();
                config.name = name.clone();
                config.vm_id = Some(facts.id);

                DeployedMachine {
                    id: facts.id.to_string(),
                    name,
                    base_type: spec.base_type,
                    deployment_time: now,
                    ip_address: facts
                        .ip
                        .map(|ip| strip_prefix_len(&ip))
                        .unwrap_or_else(|| DHCP_IP.into()),
                    mac_address: Some(facts.mac.unwrap_or_default()),
                    status: MachineStatus::Deployed,
                    last_updated: None,
                    terraform_state_path: state.clone(),
                    config,
                    deployment_result: result.clone(),
                    pack_id: Some(spec.id.clone()),
                }
            })
            .collect()
    }

    fn single_record(&self, spec: &MachineSpec, result: &ProvisioningResult) -> DeployedMachine {
        let summary = result.summary.as_ref();
        let vm_id = summary
            .and_then(|s| s.vm_ids.first().copied())
            .or(spec.vm_id);
        let id = vm_id.map(|v| v.to_string()).unwrap_or_else(|| spec.id.clone());
        let ip = summary
            .and_then(|s| s.vm_ips.first())
            .map(|ip| strip_prefix_len(ip))
            .unwrap_or_else(|| UNKNOWN_IP.into());

        let mut config = spec.clone();
        config.id = id.clone();
        if vm_id.is_some() {
            config.vm_id = vm_id;
        }

        DeployedMachine {
            terraform_state_path: self.state_file_for(result, &id),
            id,
            name: spec.name.clone(),
            base_type: spec.base_type,
            deployment_time: Utc::now(),
            ip_address: ip,
            mac_address: None,
            status: MachineStatus::Deployed,
            last_updated: None,
            config,
            deployment_result: result.clone(),
            pack_id: None,
        }
    }

    async fn load(&self) -> Result<LedgerFile> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(LedgerFile::default()),
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LedgerFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, file: &LedgerFile) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(file)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// `10.0.0.5/24` to `10.0.0.5`.
fn strip_prefix_len(ip: &str) -> String {
    ip.split('/').next().unwrap_or(ip).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdvancedOptions, BaseType, DeploymentSummary, PackGroup};

    fn spec(id: &str, base_type: BaseType) -> MachineSpec {
        MachineSpec {
            id: id.into(),
            name: "web".into(),
            base_type,
            advanced: AdvancedOptions::default(),
            group: (base_type == BaseType::VmPack).then(|| PackGroup {
                count: 2,
                os_version: None,
            }),
            vm_id: None,
        }
    }

    fn success(summary: DeploymentSummary, workdir: &Path) -> ProvisioningResult {
        ProvisioningResult {
            success: true,
            message: "ok".into(),
            output: String::new(),
            summary: Some(summary),
            failure: None,
            workdir: Some(workdir.to_path_buf()),
        }
    }

    async fn ledger(dir: &Path) -> Ledger {
        Ledger::open(dir.join("deployed_machines.json"), dir.join("deployments"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_creates_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path()).await;
        let raw = std::fs::read_to_string(ledger.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, serde_json::json!({"machines": []}));
    }

    #[tokio::test]
    async fn single_record_uses_parsed_id_and_strips_cidr() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path()).await;

        let mut summary = DeploymentSummary::minimal("web");
        summary.vm_ids = vec![5000];
        summary.vm_ips = vec!["10.0.0.5/24".into()];
        let wd = tmp.path().join("deployments/5000");

        let records = ledger.add(&spec("c-1", BaseType::LinuxServer), &success(summary, &wd)).await.unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.id, "5000");
        assert_eq!(rec.ip_address, "10.0.0.5");
        assert_eq!(rec.config.id, "5000");
        assert_eq!(rec.config.vm_id, Some(5000));
        assert_eq!(rec.terraform_state_path, wd.join(STATE_FILE));
        assert_eq!(rec.pack_id, None);
    }

    #[tokio::test]
    async fn single_record_falls_back_to_caller_id_and_unknown_ip() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path()).await;
        let wd = tmp.path().join("wd");

        let records = ledger
            .add(&spec("c-9", BaseType::WindowsServer), &success(DeploymentSummary::minimal("web"), &wd))
            .await
            .unwrap();
        assert_eq!(records[0].id, "c-9");
        assert_eq!(records[0].ip_address, "Unknown");
    }

    #[tokio::test]
    async fn single_record_prefers_allocated_id_over_caller_id() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path()).await;
        let wd = tmp.path().join("deployments/5003");

        let mut allocated = spec("c-9", BaseType::LinuxServer);
        allocated.vm_id = Some(5003);
        let records = ledger
            .add(&allocated, &success(DeploymentSummary::minimal("web"), &wd))
            .await
            .unwrap();
        assert_eq!(records[0].id, "5003");
        assert_eq!(records[0].config.vm_id, Some(5003));
        assert_eq!(records[0].terraform_state_path, wd.join(STATE_FILE));
    }

    #[tokio::test]
    async fn pack_expands_with_fallbacks() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path()).await;

        let mut summary = DeploymentSummary::minimal("web");
        summary.vm_ids = vec![5001, 5002];
        summary.vm_names = vec!["web-a".into()];
        let wd = tmp.path().join("deployments/5001");

        let records = ledger.add(&spec("pack-7", BaseType::VmPack), &success(summary, &wd)).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["5001", "5002"]);
        assert_eq!(records[0].name, "web-a");
        assert_eq!(records[1].name, "web-2");
        assert!(records.iter().all(|r| r.ip_address == "dhcp"));
        assert!(records.iter().all(|r| r.pack_id.as_deref() == Some("pack-7")));
        assert!(records.iter().all(|r| r.terraform_state_path == wd.join(STATE_FILE)));
        assert_eq!(records[1].config.vm_id, Some(5002));

        assert_eq!(ledger.remove_pack("pack-7").await.unwrap(), 2);
        assert!(ledger.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_id_is_last_write_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path()).await;
        let wd = tmp.path().join("wd");

        let mut first = DeploymentSummary::minimal("web");
        first.vm_ids = vec![5000];
        first.vm_ips = vec!["10.0.0.1".into()];
        let mut second = first.clone();
        second.vm_ips = vec!["10.0.0.2".into()];

        ledger.add(&spec("a", BaseType::LinuxServer), &success(first, &wd)).await.unwrap();
        ledger.add(&spec("b", BaseType::LinuxServer), &success(second, &wd)).await.unwrap();

        let all = ledger.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ip_address, "10.0.0.2");
    }

    #[tokio::test]
    async fn status_update_and_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = ledger(tmp.path()).await;
        let mut summary = DeploymentSummary::minimal("web");
        summary.vm_ids = vec![5000];

        ledger
            .add(&spec("a", BaseType::LinuxServer), &success(summary, &tmp.path().join("wd")))
            .await
            .unwrap();

        assert!(ledger.update_status("5000", MachineStatus::Running, Some("10.1.1.1/16")).await.unwrap());
        let rec = ledger.get("5000").await.unwrap().unwrap();
        assert_eq!(rec.status, MachineStatus::Running);
        assert_eq!(rec.ip_address, "10.1.1.1");
        assert!(rec.last_updated.is_some());

        assert!(!ledger.update_status("nope", MachineStatus::Unknown, None).await.unwrap());
        assert!(ledger.exists("5000").await.unwrap());
        assert!(ledger.state_path("5000").await.unwrap().is_some());
        assert!(ledger.remove("5000").await.unwrap());
        assert!(!ledger.remove("5000").await.unwrap());
        assert!(!ledger.exists("5000").await.unwrap());
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut summary = DeploymentSummary::minimal("web");
        summary.vm_ids = vec![5010];
        ledger(tmp.path())
            .await
            .add(&spec("a", BaseType::LinuxServer), &success(summary, &tmp.path().join("wd")))
            .await
            .unwrap();

        let reopened = ledger(tmp.path()).await;
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }
}
