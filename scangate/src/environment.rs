use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::registry::InstallRecipe;

/// An acquired execution environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvHandle {
    pub root: PathBuf,
    /// Executables installed into the environment, searched before `PATH`.
    pub bin_dir: Option<PathBuf>,
}

impl EnvHandle {
    /// `PATH` value with the environment's `bin` directory in front.
    pub fn search_path(&self) -> Option<OsString> {
        let bin = self.bin_dir.as_ref()?;
        let mut dirs = vec![bin.clone()];
        if let Some(inherited) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&inherited));
        }
        std::env::join_paths(dirs).ok()
    }
}

/// Setup/teardown of the isolated environment tools run in.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn create(&self) -> Result<EnvHandle>;

    async fn install_dependencies(&self, handle: &EnvHandle, manifest: &Path) -> Result<()>;

    /// Best-effort installation of one scanning tool.
    async fn install_tool(&self, _handle: &EnvHandle, _recipe: &InstallRecipe) -> Result<()> {
        Ok(())
    }

    /// Must not fail; problems are logged.
    fn destroy(&self, handle: EnvHandle);
}

/// Owns an environment for the duration of a run and destroys it when
/// released or dropped, whichever comes first.
pub struct EnvironmentLease {
    env: Arc<dyn Environment>,
    handle: Option<EnvHandle>,
}

impl EnvironmentLease {
    pub async fn acquire(env: Arc<dyn Environment>) -> Result<Self> {
        let handle = env.create().await?;
        debug!(root = %handle.root.display(), "environment acquired");
        Ok(Self {
            env,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> &EnvHandle {
        self.handle
            .as_ref()
            .expect("handle is only taken when the lease is consumed")
    }

    pub fn environment(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    pub fn release(mut self) {
        self.destroy();
    }

    fn destroy(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(root = %handle.root.display(), "environment released");
            self.env.destroy(handle);
        }
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A scratch directory under `base`, optionally holding a Python virtual
/// environment that tools and dependencies are installed into.
#[derive(Debug, Clone)]
pub struct WorkspaceEnvironment {
    base: PathBuf,
    python: Option<String>,
}

impl WorkspaceEnvironment {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            python: None,
        }
    }

    /// Create a virtual environment with this interpreter on `create`.
    pub fn with_python(mut self, interpreter: impl Into<String>) -> Self {
        self.python = Some(interpreter.into());
        self
    }

    fn program_in(handle: &EnvHandle, program: &str) -> PathBuf {
        match &handle.bin_dir {
            Some(bin) if bin.join(program).exists() => bin.join(program),
            _ => PathBuf::from(program),
        }
    }
}

#[async_trait]
impl Environment for WorkspaceEnvironment {
    #[instrument(skip(self), fields(base = %self.base.display()))]
    async fn create(&self) -> Result<EnvHandle> {
        let root = self.base.join(format!(".scangate-env-{}", std::process::id()));
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create environment directory {}", root.display()))?;

        let bin_dir = match &self.python {
            Some(python) => {
                let venv = root.join("venv");
                info!(%python, venv = %venv.display(), "creating virtual environment");
                run_checked(Command::new(python).arg("-m").arg("venv").arg(&venv))
                    .await
                    .context("failed to create virtual environment")
                    .inspect_err(|_| remove_dir(&root))?;
                Some(venv.join("bin"))
            }
            None => None,
        };

        Ok(EnvHandle { root, bin_dir })
    }

    #[instrument(skip(self, handle))]
    async fn install_dependencies(&self, handle: &EnvHandle, manifest: &Path) -> Result<()> {
        if !manifest.exists() {
            bail!("dependency manifest not found: {}", manifest.display());
        }
        let pip = Self::program_in(handle, "pip");
        info!(manifest = %manifest.display(), "installing dependencies");
        run_checked(Command::new(pip).arg("install").arg("-r").arg(manifest))
            .await
            .with_context(|| format!("failed to install dependencies from {}", manifest.display()))
    }

    async fn install_tool(&self, handle: &EnvHandle, recipe: &InstallRecipe) -> Result<()> {
        let program = Self::program_in(handle, &recipe.program);
        debug!(%recipe, "installing tool");
        run_checked(Command::new(program).args(&recipe.args))
            .await
            .with_context(|| format!("`{recipe}` failed"))
    }

    fn destroy(&self, handle: EnvHandle) {
        remove_dir(&handle.root);
    }
}

fn remove_dir(root: &Path) {
    match std::fs::remove_dir_all(root) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(root = %root.display(), error = %e, "failed to remove environment"),
    }
}

async fn run_checked(cmd: &mut Command) -> Result<()> {
    let output = cmd
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to spawn command")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("exited with {}: {}", output.status, stderr.trim());
    }
    Ok(())
}
