//! Environment provisioning for frameworks that need an interpreter
//! environment next to their code.
//!
//! Provisioning is a side effect of syncing: the orchestrator runs it in the
//! background and only logs the outcome. A failed provision never fails a
//! node operation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use trellis_core::config::EnvironmentConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::types::Node;

/// Directory the venv provisioner creates inside a project.
pub const VENV_DIR: &str = "venv";

/// What a provisioning attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub success: bool,
    /// Human-readable detail, usually the tail of the tool's stderr
    pub diagnostic: String,
    pub environment_path: Option<PathBuf>,
}

impl ProvisionOutcome {
    pub fn ok(environment_path: Option<PathBuf>, diagnostic: impl Into<String>) -> Self {
        Self {
            success: true,
            diagnostic: diagnostic.into(),
            environment_path,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: diagnostic.into(),
            environment_path: None,
        }
    }
}

/// Creates and updates a node's interpreter environment.
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Make sure an environment exists for `node` inside `project_path`.
    async fn ensure_environment(&self, node: &Node, project_path: &Path) -> Result<ProvisionOutcome>;

    /// Reinstall from the node's dependency manifest.
    async fn update_requirements(&self, node: &Node, project_path: &Path) -> Result<ProvisionOutcome>;
}

/// Provisioner that only records the request.
#[derive(Debug, Default, Clone)]
pub struct NoopProvisioner;

#[async_trait]
impl EnvironmentProvisioner for NoopProvisioner {
    fn name(&self) -> &str {
        "none"
    }

    async fn ensure_environment(&self, node: &Node, project_path: &Path) -> Result<ProvisionOutcome> {
        debug!(node = %node.id, "Environment provisioning disabled for {}", project_path.display());
        Ok(ProvisionOutcome::ok(None, "provisioning disabled"))
    }

    async fn update_requirements(&self, node: &Node, project_path: &Path) -> Result<ProvisionOutcome> {
        debug!(node = %node.id, "Requirements update skipped for {}", project_path.display());
        Ok(ProvisionOutcome::ok(None, "provisioning disabled"))
    }
}

/// Python virtual environments via `python -m venv` and `pip install -r`.
#[derive(Debug, Clone)]
pub struct VenvProvisioner {
    python: String,
}

impl VenvProvisioner {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    fn pip_path(venv: &Path) -> PathBuf {
        if cfg!(windows) {
            venv.join("Scripts").join("pip.exe")
        } else {
            venv.join("bin").join("pip")
        }
    }

    fn manifest_path(node: &Node, project_path: &Path) -> Option<PathBuf> {
        node.framework
            .descriptor()
            .manifest_file
            .map(|manifest| project_path.join(manifest))
    }

    async fn install_requirements(&self, node: &Node, project_path: &Path) -> Result<ProvisionOutcome> {
        let venv = project_path.join(VENV_DIR);
        let Some(manifest) = Self::manifest_path(node, project_path) else {
            return Ok(ProvisionOutcome::ok(Some(venv), "no manifest for framework"));
        };

        let has_requirements = tokio::fs::read_to_string(&manifest)
            .await
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false);
        if !has_requirements {
            return Ok(ProvisionOutcome::ok(Some(venv), "no requirements to install"));
        }

        let pip = Self::pip_path(&venv);
        let manifest_arg = manifest.to_string_lossy().into_owned();
        run_tool(&pip.to_string_lossy(), &["install", "-r", &manifest_arg], project_path)
            .await
            .map(|outcome| ProvisionOutcome {
                environment_path: Some(venv),
                ..outcome
            })
    }
}

#[async_trait]
impl EnvironmentProvisioner for VenvProvisioner {
    fn name(&self) -> &str {
        "venv"
    }

    async fn ensure_environment(&self, node: &Node, project_path: &Path) -> Result<ProvisionOutcome> {
        let venv = project_path.join(VENV_DIR);
        if !venv.is_dir() {
            info!(node = %node.id, "Creating virtual environment in {}", venv.display());
            let created = run_tool(&self.python, &["-m", "venv", VENV_DIR], project_path).await?;
            if !created.success {
                return Ok(created);
            }
        }
        self.install_requirements(node, project_path).await
    }

    async fn update_requirements(&self, node: &Node, project_path: &Path) -> Result<ProvisionOutcome> {
        if !project_path.join(VENV_DIR).is_dir() {
            return self.ensure_environment(node, project_path).await;
        }
        self.install_requirements(node, project_path).await
    }
}

/// Pick the provisioner named by configuration.
pub fn provisioner_from_config(config: &EnvironmentConfig) -> Result<Arc<dyn EnvironmentProvisioner>> {
    match config.provisioner.as_str() {
        "none" => Ok(Arc::new(NoopProvisioner)),
        "venv" => Ok(Arc::new(VenvProvisioner::new(config.python.clone()))),
        other => Err(TrellisError::config(format!("Unknown provisioner '{}'", other))),
    }
}

async fn run_tool(program: &str, args: &[&str], working_dir: &Path) -> Result<ProvisionOutcome> {
    let start = Instant::now();
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| TrellisError::provisioning(format!("Failed to execute {}: {}", program, e)))?;

    let duration_ms = start.elapsed().as_millis();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let diagnostic = lines[lines.len().saturating_sub(5)..].join("\n");

    if output.status.success() {
        debug!("{} finished in {}ms", program, duration_ms);
        Ok(ProvisionOutcome::ok(None, diagnostic))
    } else {
        let code = output.status.code().unwrap_or(-1);
        warn!("{} failed with exit code {} in {}ms", program, code, duration_ms);
        Ok(ProvisionOutcome::failed(format!("exit code {}: {}", code, diagnostic)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use trellis_core::framework::Framework;
    use trellis_core::types::NodeKind;

    #[tokio::test]
    async fn test_noop_provisioner_succeeds() {
        let temp = TempDir::new().unwrap();
        let node = Node::new("api", NodeKind::Backend, Framework::Python);
        let outcome = NoopProvisioner
            .ensure_environment(&node, temp.path())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.environment_path.is_none());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_error() {
        let temp = TempDir::new().unwrap();
        let node = Node::new("api", NodeKind::Backend, Framework::Python);
        let provisioner = VenvProvisioner::new("trellis-no-such-python-interpreter");
        let err = provisioner
            .ensure_environment(&node, temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::Provisioning(_)));
    }

    #[test]
    fn test_provisioner_from_config() {
        let mut config = EnvironmentConfig::default();
        assert_eq!(provisioner_from_config(&config).unwrap().name(), "none");

        config.provisioner = "venv".to_string();
        assert_eq!(provisioner_from_config(&config).unwrap().name(), "venv");

        config.provisioner = "conda".to_string();
        assert!(provisioner_from_config(&config).is_err());
    }
}
