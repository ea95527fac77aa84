//! End-to-end deploy, destroy and health flows against scripted fakes.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use fleet_infra::allocator::InventorySource;
use fleet_infra::discovery::{DiscoverySource, GuestNetworkSource, ReachabilityProbe};
use fleet_infra::driver::{CommandOutput, CommandRunner, RunError};
use fleet_infra::types::{FailureKind, MachineSpec, MachineStatus};
use fleet_infra::{Deployer, Error, FleetConfig, ProxmoxConnection};
use pve_api::{AgentNetwork, ContainerConfig, ContainerInterfaces};

// ── Fakes ───────────────────────────────────────────────────────────

struct FixedInventory(HashSet<u32>);

#[async_trait]
impl InventorySource for FixedInventory {
    async fn existing_vmids(&self) -> Option<HashSet<u32>> {
        Some(self.0.clone())
    }
}

#[derive(Default)]
struct ScriptedRunner {
    script: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new(script: Vec<CommandOutput>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::default(),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _dir: &Path, args: &[&str], _timeout: Duration) -> Result<CommandOutput, RunError> {
        self.calls.lock().unwrap().push(args.join(" "));
        Ok(self.script.lock().unwrap().pop_front().unwrap_or_else(|| ok("")))
    }
}

/// A container with a DHCP config whose interfaces report an address.
#[derive(Default)]
struct DhcpContainer;

#[async_trait]
impl GuestNetworkSource for DhcpContainer {
    async fn vm_status(&self, _vm_id: u32) -> Option<String> {
        None
    }

    async fn agent_interfaces(&self, _vm_id: u32) -> Option<AgentNetwork> {
        None
    }

    async fn container_status(&self, _vm_id: u32) -> Option<String> {
        Some("running".into())
    }

    async fn container_config(&self, _vm_id: u32) -> Option<ContainerConfig> {
        json!({"hostname": "ct", "net0": "name=eth0,bridge=vmbr0,ip=dhcp"})
            .as_object()
            .cloned()
    }

    async fn container_interfaces(&self, _vm_id: u32) -> Option<ContainerInterfaces> {
        Some(json!([
            {"name": "lo", "inet": "127.0.0.1/8"},
            {"name": "eth0", "inet": "10.0.0.5/24", "hwaddr": "bc:24:11:00:00:01"}
        ]))
    }
}

struct NothingAnswers;

#[async_trait]
impl GuestNetworkSource for NothingAnswers {
    async fn vm_status(&self, _vm_id: u32) -> Option<String> {
        None
    }
    async fn agent_interfaces(&self, _vm_id: u32) -> Option<AgentNetwork> {
        None
    }
    async fn container_status(&self, _vm_id: u32) -> Option<String> {
        None
    }
    async fn container_config(&self, _vm_id: u32) -> Option<ContainerConfig> {
        None
    }
    async fn container_interfaces(&self, _vm_id: u32) -> Option<ContainerInterfaces> {
        None
    }
}

struct Reachable;

#[async_trait]
impl ReachabilityProbe for Reachable {
    async fn ping(&self, _ip: Ipv4Addr) -> bool {
        true
    }
    async fn ssh_open(&self, _ip: Ipv4Addr) -> bool {
        false
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        success: true,
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        success: false,
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

const SINGLE_APPLY: &str = "\
proxmox_vm_qemu.vm: Creating...
proxmox_vm_qemu.vm: Creation complete after 41s [id=pve1/qemu/5000]

Apply complete! Resources: 1 added, 0 changed, 0 destroyed.

Outputs:

vm_id = 5000
vm_name = \"web-01\"
";

const PACK_APPLY: &str = "\
Apply complete! Resources: 2 added, 0 changed, 0 destroyed.

Outputs:

vm_ids = [
  5001,
  5002,
]
vm_names = [
  \"lab-1\",
  \"lab-2\",
]
";

const LOCKED: &str = "\
Error: Error acquiring the state lock

Lock Info:
  ID:        8c2e7f10-4b3a-4d2e-9f61-0a1b2c3d4e5f
  Path:      terraform.tfstate
  Operation: OperationTypeApply
";

struct Harness {
    _tmp: tempfile::TempDir,
    deployer: Deployer,
    runner: Arc<ScriptedRunner>,
    data: std::path::PathBuf,
}

async fn harness(
    taken: &[u32],
    script: Vec<CommandOutput>,
    guests: Arc<dyn GuestNetworkSource>,
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let data = tmp.path().to_path_buf();
    let templates = data.join("templates");
    for family in ["linux-vm", "linux-ct", "windows-vm", "vm-pack"] {
        std::fs::create_dir_all(templates.join(family)).unwrap();
        std::fs::write(templates.join(family).join("main.tf"), "# template\n").unwrap();
    }

    let config = FleetConfig {
        proxmox: ProxmoxConnection {
            server: "pve.lan".into(),
            port: None,
            token: "root@pam!fleet=secret".into(),
            node: "pve1".into(),
            accept_invalid_certs: false,
        },
        data_dir: data.clone(),
        templates_dir: templates,
        terraform_bin: "terraform".into(),
        unlock_grace: Duration::ZERO,
    };

    let runner = ScriptedRunner::new(script);
    let deployer = Deployer::new(
        config,
        Arc::new(FixedInventory(taken.iter().copied().collect())),
        guests,
        runner.clone(),
        Arc::new(Reachable),
    )
    .await
    .unwrap();

    Harness {
        _tmp: tmp,
        deployer,
        runner,
        data,
    }
}

fn spec(value: Value) -> MachineSpec {
    serde_json::from_value(value).unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn dhcp_linux_server_gets_first_free_id() {
    let h = harness(&[], vec![ok(""), ok(""), ok(SINGLE_APPLY)], Arc::new(NothingAnswers)).await;

    let report = h
        .deployer
        .deploy_machines(vec![spec(json!({
            "id": 1,
            "name": "web 01",
            "baseType": "linuxServer",
            "advanced": {"perf": "medium", "ip_mode": "dhcp"}
        }))])
        .await;

    assert_eq!((report.total, report.successful, report.failed), (1, 1, 0));
    let outcome = &report.results[0];
    assert_eq!(outcome.vm_id, Some(5000));

    let tfvars = std::fs::read_to_string(h.data.join("deployments/5000/terraform.tfvars")).unwrap();
    assert!(tfvars.contains("vm_id = 5000\n"));
    assert!(tfvars.contains("vm_name = \"web-01\"\n"));
    assert!(tfvars.contains("cores = 2\n"));
    assert!(tfvars.contains("memory = 2048\n"));
    assert!(tfvars.contains("network_config = \"dhcp\"\n"));
    assert!(h.data.join("deployments/5000/machine_config.json").exists());

    let records = h.deployer.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "5000");
    assert_eq!(records[0].status, MachineStatus::Deployed);
}

#[tokio::test]
async fn pack_records_share_pack_id() {
    let h = harness(&[5000], vec![ok(""), ok(""), ok(PACK_APPLY)], Arc::new(NothingAnswers)).await;

    let report = h
        .deployer
        .deploy_machines(vec![spec(json!({
            "id": "pack-1",
            "name": "lab",
            "baseType": "vmPack",
            "group": {"count": 2, "os_version": "debian-12"}
        }))])
        .await;

    assert_eq!(report.successful, 1);
    assert_eq!(report.results[0].vm_id, Some(5001));

    let tfvars = std::fs::read_to_string(h.data.join("deployments/5001/terraform.tfvars")).unwrap();
    assert!(tfvars.contains("start_vmid = 5001\n"));
    assert!(tfvars.contains("vm_count = 2\n"));

    let mut records = h.deployer.list().await.unwrap();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["5001", "5002"]);
    assert!(records.iter().all(|r| r.ip_address == "dhcp"));
    assert!(records.iter().all(|r| r.pack_id.as_deref() == Some("pack-1")));
}

#[tokio::test]
async fn plan_failure_leaves_no_record() {
    let h = harness(&[], vec![ok(""), fail("Error: Unsupported argument")], Arc::new(NothingAnswers)).await;

    let report = h
        .deployer
        .deploy_machines(vec![spec(json!({"id": "a", "name": "broken", "baseType": "windowsServer"}))])
        .await;

    assert_eq!((report.successful, report.failed), (0, 1));
    let result = &report.results[0].result;
    assert_eq!(result.failure, Some(FailureKind::Plan));
    assert!(result.message.contains("plan failed"));
    assert!(result.output.contains("Unsupported argument"));
    assert!(h.deployer.list().await.unwrap().is_empty());
    assert_eq!(h.runner.calls().len(), 2);
}

#[tokio::test]
async fn lock_contention_forces_exactly_one_unlock() {
    let h = harness(
        &[],
        vec![ok(""), fail(LOCKED), ok(""), ok(""), ok(""), ok(SINGLE_APPLY)],
        Arc::new(NothingAnswers),
    )
    .await;

    let report = h
        .deployer
        .deploy_machines(vec![spec(json!({"id": "a", "name": "web-01", "baseType": "linuxServer"}))])
        .await;

    assert_eq!(report.successful, 1, "{:?}", report.results[0].result);
    let unlocks: Vec<_> = h
        .runner
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("force-unlock"))
        .collect();
    assert_eq!(unlocks, ["force-unlock -force 8c2e7f10-4b3a-4d2e-9f61-0a1b2c3d4e5f"]);
}

#[tokio::test]
async fn discovery_falls_through_to_container_interfaces() {
    let h = harness(&[], vec![ok(""), ok(""), ok(SINGLE_APPLY)], Arc::new(DhcpContainer)).await;
    h.deployer
        .deploy_machines(vec![spec(json!({
            "id": "a",
            "name": "web-01",
            "baseType": "linuxServer",
            "advanced": {"type": "ct"}
        }))])
        .await;

    let report = h.deployer.health_check("5000").await.unwrap();
    assert_eq!(report.ip_address, Some(Ipv4Addr::new(10, 0, 0, 5)));
    assert_eq!(report.source, DiscoverySource::Interfaces);
    assert!(report.ping_success);
    assert!(!report.ssh_available);

    let record = h.deployer.get("5000").await.unwrap().unwrap();
    assert_eq!(record.status, MachineStatus::Running);
    assert_eq!(record.ip_address, "10.0.0.5");
    assert!(record.last_updated.is_some());
}

#[tokio::test]
async fn exhausted_discovery_marks_unknown() {
    let h = harness(&[], vec![ok(""), ok(""), ok(SINGLE_APPLY)], Arc::new(NothingAnswers)).await;
    h.deployer
        .deploy_machines(vec![spec(json!({"id": "a", "name": "web-01", "baseType": "linuxServer"}))])
        .await;

    let report = h.deployer.health_check("5000").await.unwrap();
    assert_eq!(report.source, DiscoverySource::None);
    assert_eq!(report.ip_address, None);
    assert!(!report.ping_success);

    let record = h.deployer.get("5000").await.unwrap().unwrap();
    assert_eq!(record.status, MachineStatus::Unknown);
}

#[tokio::test]
async fn destroy_removes_workdir_and_record() {
    let h = harness(&[], vec![ok(""), ok(""), ok(SINGLE_APPLY)], Arc::new(NothingAnswers)).await;
    h.deployer
        .deploy_machines(vec![spec(json!({"id": "a", "name": "web-01", "baseType": "linuxServer"}))])
        .await;
    assert_eq!(h.deployer.list_deployments().await.unwrap().len(), 1);

    let result = h.deployer.destroy("5000").await.unwrap();
    assert!(result.success, "{}", result.message);
    assert!(!h.data.join("deployments/5000").exists());
    assert!(h.deployer.list().await.unwrap().is_empty());
    assert!(h.deployer.list_deployments().await.unwrap().is_empty());

    assert!(h.deployer.destroy("5000").await.is_err());
}

#[tokio::test]
async fn explicit_vmid_out_of_range_fails_alone() {
    let h = harness(&[], vec![ok(""), ok(""), ok(SINGLE_APPLY)], Arc::new(NothingAnswers)).await;

    let report = h
        .deployer
        .deploy_machines(vec![
            spec(json!({"id": "bad", "name": "low", "baseType": "linuxServer", "advanced": {"vmid": "42"}})),
            spec(json!({"id": "good", "name": "web-01", "baseType": "linuxServer"})),
        ])
        .await;

    assert_eq!((report.total, report.successful, report.failed), (2, 1, 1));
    assert_eq!(report.results[0].result.failure, Some(FailureKind::Unexpected));
    assert!(report.results[0].result.message.contains("outside"));
    assert_eq!(report.results[1].vm_id, Some(5000));
}

#[tokio::test]
async fn sequential_deploys_never_share_an_id() {
    let h = harness(
        &[],
        vec![ok(""), ok(""), ok("Outputs:\n\nvm_id = 5000\n"), ok(""), ok(""), ok("Outputs:\n\nvm_id = 5001\n")],
        Arc::new(NothingAnswers),
    )
    .await;

    let report = h
        .deployer
        .deploy_machines(vec![
            spec(json!({"id": "a", "name": "one", "baseType": "linuxServer"})),
            spec(json!({"id": "b", "name": "two", "baseType": "linuxServer"})),
        ])
        .await;

    let ids: Vec<_> = report.results.iter().map(|r| r.vm_id).collect();
    assert_eq!(ids, [Some(5000), Some(5001)]);
}

#[tokio::test]
async fn concurrent_deploys_pick_distinct_ids() {
    let h = harness(&[5000], Vec::new(), Arc::new(NothingAnswers)).await;

    let (a, b) = tokio::join!(
        h.deployer
            .deploy_one(spec(json!({"id": "a", "name": "one", "baseType": "linuxServer"}))),
        h.deployer
            .deploy_one(spec(json!({"id": "b", "name": "two", "baseType": "linuxServer"}))),
    );

    assert!(a.result.success, "{}", a.result.message);
    assert!(b.result.success, "{}", b.result.message);
    let ids: HashSet<u32> = [a.vm_id.unwrap(), b.vm_id.unwrap()].into();
    assert_eq!(ids, HashSet::from([5001, 5002]));

    assert_ne!(a.result.workdir, b.result.workdir);
    for id in ids {
        assert!(h.data.join(format!("deployments/{id}/terraform.tfvars")).exists());
    }
    assert_eq!(h.deployer.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn destroy_rejects_ids_that_escape_the_deployments_root() {
    let h = harness(&[], Vec::new(), Arc::new(NothingAnswers)).await;
    let outside = h.data.join("templates/linux-vm");

    for id in ["../templates/linux-vm", "..", ".", "", outside.to_str().unwrap()] {
        let err = h.deployer.destroy(id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)), "{id:?}: {err}");
    }

    assert!(outside.join("main.tf").exists());
    assert!(h.data.join("deployments").exists());
    assert!(h.runner.calls().is_empty());
}
