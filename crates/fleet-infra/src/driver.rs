//! Terraform working directories and the init/plan/apply lifecycle.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use crate::descriptor::VariableMap;
use crate::output::{clean_output, extract_summary, format_success_message};
use crate::types::{FailureKind, MachineSpec, ProvisioningResult, TemplateKind};
use crate::{Error, Result};

pub const TFVARS_FILE: &str = "terraform.tfvars";
pub const CONFIG_FILE: &str = "machine_config.json";
pub const STATE_FILE: &str = "terraform.tfstate";
const MODULES_DIR: &str = "modules";

const LOCK_SIGNATURE: &str = "Error acquiring the state lock";
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(60);

static LOCK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ID: +([a-f0-9-]+)").expect("valid regex"));

// ── Command runner ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not run command: {0}")]
    Io(#[from] io::Error),
}

/// Runs one tool invocation in a directory, bounded by `timeout`.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, RunError>;
}

/// The real `terraform` binary. A run that outlives its timeout is killed.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    bin: String,
}

impl TerraformCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

#[async_trait]
impl CommandRunner for TerraformCli {
    async fn run(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, RunError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        trace!(
            cmd = %format!("{} {}", self.bin, args.join(" ")),
            dir = %dir.display(),
            "running terraform"
        );

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(res) => res?,
            Err(_) => return Err(RunError::Timeout(timeout)),
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ── Lifecycle steps ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Init,
    Plan,
    Apply,
    PlanDestroy,
    Destroy,
}

const APPLY_STEPS: [Step; 3] = [Step::Init, Step::Plan, Step::Apply];
const DESTROY_STEPS: [Step; 3] = [Step::Init, Step::PlanDestroy, Step::Destroy];

impl Step {
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Self::Init => &["init", "-input=false", "-no-color"],
            Self::Plan => &["plan", "-input=false", "-no-color"],
            Self::Apply => &["apply", "-auto-approve", "-input=false", "-no-color"],
            Self::PlanDestroy => &["plan", "-destroy", "-input=false", "-no-color"],
            Self::Destroy => &["destroy", "-auto-approve", "-input=false", "-no-color"],
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Init | Self::Plan | Self::PlanDestroy => Duration::from_secs(300),
            Self::Apply | Self::Destroy => Duration::from_secs(600),
        }
    }

    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Init => FailureKind::Init,
            Self::Plan | Self::PlanDestroy => FailureKind::Plan,
            Self::Apply => FailureKind::Apply,
            Self::Destroy => FailureKind::Destroy,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Plan | Self::PlanDestroy => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        })
    }
}

#[derive(Debug)]
enum StepFailure {
    Exited { step: Step, output: CommandOutput },
    TimedOut { step: Step },
    Spawn { step: Step, error: String },
}

impl StepFailure {
    /// Lock id when the step failed because another run holds the state lock.
    fn contended_lock(&self) -> Option<String> {
        let Self::Exited { output, .. } = self else {
            return None;
        };
        let text = format!("{}\n{}", output.stderr, output.stdout);
        if !text.contains(LOCK_SIGNATURE) {
            return None;
        }
        LOCK_ID.captures(&text).map(|c| c[1].to_string())
    }

    fn into_result(self, label: &str) -> ProvisioningResult {
        match self {
            Self::Exited { step, output } => {
                let evidence = if output.stderr.trim().is_empty() {
                    &output.stdout
                } else {
                    &output.stderr
                };
                ProvisioningResult::failed(
                    step.failure_kind(),
                    format!("Terraform {step} failed for {label}"),
                    clean_output(evidence),
                )
            }
            Self::TimedOut { step } => ProvisioningResult::failed(
                FailureKind::Timeout,
                format!("Terraform {step} timed out for {label}"),
                "Operation timed out",
            ),
            Self::Spawn { step, error } => ProvisioningResult::failed(
                FailureKind::Unexpected,
                format!("Terraform {step} error for {label}: {error}"),
                error,
            ),
        }
    }
}

/// A working directory found under the deployments root.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentEntry {
    pub machine_id: String,
    pub config: Value,
    pub deployment_path: PathBuf,
}

// ── Driver ──────────────────────────────────────────────────────────

/// Prepares working directories and drives the tool through them.
pub struct TerraformDriver {
    runner: Arc<dyn CommandRunner>,
    templates_dir: PathBuf,
    /// Only direct children of this directory are ever destroyed.
    deployments_dir: PathBuf,
    unlock_grace: Duration,
}

impl TerraformDriver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        templates_dir: impl Into<PathBuf>,
        deployments_dir: impl Into<PathBuf>,
        unlock_grace: Duration,
    ) -> Self {
        Self {
            runner,
            templates_dir: templates_dir.into(),
            deployments_dir: deployments_dir.into(),
            unlock_grace,
        }
    }

    /// Lay out `workdir`: template `*.tf` files, the shared `modules`
    /// directory, the rendered variables and the request itself.
    pub async fn prepare(&self, spec: &MachineSpec, vars: &VariableMap, workdir: &Path) -> Result<()> {
        let template = self.templates_dir.join(TemplateKind::for_spec(spec).dir_name());
        if !tokio::fs::try_exists(&template).await.unwrap_or(false) {
            return Err(Error::TemplateMissing(template.display().to_string()));
        }

        tokio::fs::create_dir_all(workdir).await?;

        let mut copied = 0usize;
        let mut entries = tokio::fs::read_dir(&template).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tf") && entry.file_type().await?.is_file() {
                tokio::fs::copy(&path, workdir.join(entry.file_name())).await?;
                copied += 1;
            }
        }

        let modules = self.templates_dir.join(MODULES_DIR);
        let modules_dst = workdir.join(MODULES_DIR);
        if tokio::fs::try_exists(&modules).await.unwrap_or(false)
            && !tokio::fs::try_exists(&modules_dst).await.unwrap_or(false)
        {
            let source = tokio::fs::canonicalize(&modules).await?;
            if let Err(e) = link_dir(&source, &modules_dst).await {
                debug!(error = %e, "symlink unavailable, copying modules");
                let dst = modules_dst.clone();
                tokio::task::spawn_blocking(move || copy_dir_all(&source, &dst))
                    .await
                    .map_err(io::Error::other)??;
            }
        }

        tokio::fs::write(workdir.join(TFVARS_FILE), vars.render()).await?;
        tokio::fs::write(workdir.join(CONFIG_FILE), serde_json::to_vec_pretty(spec)?).await?;

        info!(
            workdir = %workdir.display(),
            template = TemplateKind::for_spec(spec).dir_name(),
            copied,
            "prepared working directory"
        );
        Ok(())
    }

    /// `init`, `plan`, `apply -auto-approve`. `single` enables the
    /// one-machine output fallbacks when parsing the result.
    pub async fn apply(&self, workdir: &Path, label: &str, single: bool) -> ProvisioningResult {
        info!(workdir = %workdir.display(), label, "applying");

        match self.run_with_unlock(workdir, label, &APPLY_STEPS).await {
            Ok(out) => {
                let cleaned = clean_output(&out.stdout);
                let summary = extract_summary(&cleaned, label, single);
                info!(
                    label,
                    resources = summary.resources_created,
                    ids = ?summary.vm_ids,
                    "apply complete"
                );
                ProvisioningResult {
                    success: true,
                    message: format_success_message(&summary),
                    output: cleaned,
                    summary: Some(summary),
                    failure: None,
                    workdir: Some(workdir.to_path_buf()),
                }
            }
            Err(mut result) => {
                result.workdir = Some(workdir.to_path_buf());
                warn!(label, failure = ?result.failure, message = %result.message, "apply failed");
                result
            }
        }
    }

    /// True when `workdir` resolves to a direct child of the deployments root.
    async fn owns_workdir(&self, workdir: &Path) -> bool {
        let (Ok(root), Ok(dir)) = (
            tokio::fs::canonicalize(&self.deployments_dir).await,
            tokio::fs::canonicalize(workdir).await,
        ) else {
            return false;
        };
        dir.parent() == Some(root.as_path())
    }

    /// `init`, `plan -destroy`, `destroy -auto-approve`; removes `workdir`
    /// once the guests are gone.
    pub async fn destroy(&self, workdir: &Path, label: &str) -> ProvisioningResult {
        if !tokio::fs::try_exists(workdir).await.unwrap_or(false) {
            return ProvisioningResult::failed(
                FailureKind::Unexpected,
                format!("Deployment not found for machine {label}"),
                "",
            );
        }

        if !self.owns_workdir(workdir).await {
            warn!(workdir = %workdir.display(), label, "refusing to destroy outside the deployments root");
            return ProvisioningResult::failed(
                FailureKind::Unexpected,
                format!("Refusing to destroy {label}: not a deployment working directory"),
                "",
            );
        }

        info!(workdir = %workdir.display(), label, "destroying");

        match self.run_with_unlock(workdir, label, &DESTROY_STEPS).await {
            Ok(out) => {
                if let Err(e) = tokio::fs::remove_dir_all(workdir).await {
                    warn!(workdir = %workdir.display(), error = %e, "failed to remove working directory");
                }
                ProvisioningResult {
                    success: true,
                    message: format!("Successfully destroyed {label}"),
                    output: clean_output(&out.stdout),
                    summary: None,
                    failure: None,
                    workdir: Some(workdir.to_path_buf()),
                }
            }
            Err(mut result) => {
                result.workdir = Some(workdir.to_path_buf());
                warn!(label, failure = ?result.failure, message = %result.message, "destroy failed");
                result
            }
        }
    }

    /// Working directories under `root` that hold a saved request.
    pub async fn list_deployments(root: &Path) -> Result<Vec<DeploymentEntry>> {
        let mut found = Vec::new();

        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let config_file = path.join(CONFIG_FILE);
            let raw = match tokio::fs::read(&config_file).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let config = match serde_json::from_slice(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %config_file.display(), error = %e, "unreadable machine config");
                    continue;
                }
            };
            found.push(DeploymentEntry {
                machine_id: entry.file_name().to_string_lossy().into_owned(),
                config,
                deployment_path: path,
            });
        }

        found.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        Ok(found)
    }

    /// Run `steps`, recovering once from state-lock contention.
    ///
    /// With a grace delay the sequence is first re-run after waiting, so a
    /// lock held by a live run can be released normally. A lock that is
    /// still held is force-unlocked exactly once and the sequence retried
    /// exactly once more; any further contention is terminal.
    async fn run_with_unlock(
        &self,
        workdir: &Path,
        label: &str,
        steps: &[Step],
    ) -> std::result::Result<CommandOutput, ProvisioningResult> {
        let mut attempt = self.run_sequence(workdir, steps).await;

        let contended = matches!(&attempt, Err(f) if f.contended_lock().is_some());
        if contended && !self.unlock_grace.is_zero() {
            info!(label, grace = ?self.unlock_grace, "state locked, waiting before retry");
            tokio::time::sleep(self.unlock_grace).await;
            attempt = self.run_sequence(workdir, steps).await;
        }

        let failure = match attempt {
            Ok(out) => return Ok(out),
            Err(failure) => failure,
        };
        let Some(lock_id) = failure.contended_lock() else {
            return Err(failure.into_result(label));
        };

        warn!(label, lock_id = %lock_id, "state lock held, forcing unlock");
        let unlock = self
            .runner
            .run(workdir, &["force-unlock", "-force", &lock_id], UNLOCK_TIMEOUT)
            .await;
        match unlock {
            Ok(out) if out.success => {}
            Ok(out) => {
                let evidence = if out.stderr.trim().is_empty() { out.stdout } else { out.stderr };
                return Err(ProvisioningResult::failed(
                    FailureKind::Unlock,
                    format!("Failed to unlock state for {label}"),
                    clean_output(&evidence),
                ));
            }
            Err(e) => {
                return Err(ProvisioningResult::failed(
                    FailureKind::Unlock,
                    format!("Failed to unlock state for {label}"),
                    e.to_string(),
                ));
            }
        }

        self.run_sequence(workdir, steps)
            .await
            .map_err(|f| f.into_result(label))
    }

    /// Abort on the first step that does not exit cleanly; return the last
    /// step's output otherwise.
    async fn run_sequence(
        &self,
        workdir: &Path,
        steps: &[Step],
    ) -> std::result::Result<CommandOutput, StepFailure> {
        let mut last = CommandOutput::default();

        for &step in steps {
            debug!(workdir = %workdir.display(), %step, "terraform step");
            last = match self.runner.run(workdir, step.args(), step.timeout()).await {
                Ok(out) if out.success => out,
                Ok(output) => return Err(StepFailure::Exited { step, output }),
                Err(RunError::Timeout(_)) => return Err(StepFailure::TimedOut { step }),
                Err(RunError::Io(e)) => {
                    return Err(StepFailure::Spawn {
                        step,
                        error: e.to_string(),
                    });
                }
            };
        }

        Ok(last)
    }
}

#[cfg(unix)]
async fn link_dir(src: &Path, dst: &Path) -> io::Result<()> {
    tokio::fs::symlink(src, dst).await
}

#[cfg(not(unix))]
async fn link_dir(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "directory symlinks unavailable"))
}

fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
