use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::types::{MAX_VMID, MIN_VMID};
use crate::{Error, Result};

static VM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*vm_id\s*=\s*(\d+)").expect("valid regex"));
static START_VMID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*start_vmid\s*=\s*(\d+)").expect("valid regex"));
static VM_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*vm_count\s*=\s*(\d+)").expect("valid regex"));

/// Source of ids already taken on the hypervisor.
#[async_trait]
pub trait InventorySource: Send + Sync + 'static {
    /// Every VM and container id across all nodes, or `None` when the
    /// inventory could not be read.
    async fn existing_vmids(&self) -> Option<HashSet<u32>>;
}

/// Finds unused numeric ids by merging hypervisor inventory with the ids
/// recorded in local working directories.
///
/// The allocator is deterministic but not atomic: callers that commit a
/// working directory for the returned id must hold the deployer's
/// allocation lock across allocate-then-commit.
pub struct IdAllocator {
    inventory: Arc<dyn InventorySource>,
    deployments_dir: PathBuf,
}

impl IdAllocator {
    pub fn new(inventory: Arc<dyn InventorySource>, deployments_dir: impl Into<PathBuf>) -> Self {
        Self {
            inventory,
            deployments_dir: deployments_dir.into(),
        }
    }

    pub async fn allocate_one(&self) -> Result<u32> {
        self.allocate_range(1).await
    }

    /// Start of a free block of `count` consecutive ids.
    pub async fn allocate_range(&self, count: u32) -> Result<u32> {
        let excluded = self.exclusion_set().await;
        let start = find_free_block(&excluded, count)?;
        info!(start, count, excluded = excluded.len(), "allocated vmid block");
        Ok(start)
    }

    /// Union of hypervisor inventory and locally recorded ids. Computed
    /// fresh on every call.
    pub async fn exclusion_set(&self) -> HashSet<u32> {
        let mut excluded = match self.inventory.existing_vmids().await {
            Some(ids) => ids,
            None => {
                warn!("hypervisor inventory unavailable, allocating from local state only");
                HashSet::new()
            }
        };
        excluded.extend(scan_deployments(&self.deployments_dir).await);
        excluded
    }
}

/// First block of `count` free ids in `[MIN_VMID, MAX_VMID]`.
///
/// When no such block exists the candidate is `max(excluded) + 1`, or
/// `MIN_VMID` for an empty set; a candidate whose block would pass
/// `MAX_VMID` is reported as exhaustion.
pub fn find_free_block(excluded: &HashSet<u32>, count: u32) -> Result<u32> {
    let count = count.max(1);

    let mut run_start = MIN_VMID;
    let mut run_len = 0u32;
    for id in MIN_VMID..=MAX_VMID {
        if excluded.contains(&id) {
            run_len = 0;
            run_start = id.saturating_add(1);
        } else {
            run_len += 1;
            if run_len == count {
                return Ok(run_start);
            }
        }
    }

    let candidate = excluded
        .iter()
        .max()
        .map(|max| u64::from(*max) + 1)
        .unwrap_or(u64::from(MIN_VMID));

    if candidate + u64::from(count) - 1 > u64::from(MAX_VMID) {
        return Err(Error::AllocationExhausted { count, candidate });
    }

    warn!(candidate, count, "no free block in range, using sequential fallback");
    // Bounded by MAX_VMID above.
    Ok(candidate as u32)
}

/// Ids recorded in every `<deployments>/*/terraform.tfvars`.
async fn scan_deployments(dir: &Path) -> HashSet<u32> {
    let mut ids = HashSet::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "no deployments directory to scan");
            return ids;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to list deployments");
                break;
            }
        };

        let tfvars = entry.path().join("terraform.tfvars");
        match tokio::fs::read_to_string(&tfvars).await {
            Ok(content) => ids.extend(ids_in_descriptor(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %tfvars.display(), error = %e, "could not read descriptor"),
        }
    }

    ids
}

/// Ids a descriptor claims: `vm_id`, plus the full pack block when
/// `start_vmid` and `vm_count` are both present.
pub fn ids_in_descriptor(content: &str) -> Vec<u32> {
    let capture = |re: &Regex| -> Vec<u32> {
        re.captures_iter(content)
            .filter_map(|c| c[1].parse().ok())
            .collect()
    };

    let mut ids = capture(&VM_ID);
    let starts = capture(&START_VMID);
    let count = capture(&VM_COUNT).first().copied().unwrap_or(1).max(1);

    for start in starts {
        ids.extend((0..count).filter_map(|i| start.checked_add(i)));
    }
    ids
}
