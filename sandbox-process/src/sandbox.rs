use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use sandbox::{
    ExecRequest, ExecutionPolicy, ExitOutcome, ProcessExit, Result, Sandbox, SandboxConfig,
    SandboxError,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::capture::{collect, spawn_capture};
use crate::cgroup::InstanceCgroup;
use crate::launcher::Launcher;
use crate::live::LiveSet;
use crate::paths::InstancePaths;
use crate::process::{kill_process_group, remove_tree, remove_tree_blocking};

/// How long to keep reading output after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceState {
    Ready,
    Running,
    Released,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Released => write!(f, "released"),
        }
    }
}

/// A sandbox instance backed by a per-instance directory tree and a
/// launcher (bubblewrap or plain host process).
pub struct ProcessSandbox {
    id: String,
    request_id: String,
    policy: Arc<ExecutionPolicy>,
    paths: InstancePaths,
    workspace: PathBuf,
    workdir: PathBuf,
    launcher: Launcher,
    live: Arc<LiveSet>,
    created_at: SystemTime,
    state: InstanceState,
    /// Process group of the program currently (or last) running.
    pgid: Option<i32>,
    cgroup: Option<InstanceCgroup>,
    /// Allowed by the policy but blocked on this host.
    withheld: Vec<String>,
}

impl ProcessSandbox {
    pub(crate) fn new(
        config: SandboxConfig,
        paths: InstancePaths,
        launcher: Launcher,
        cgroup: Option<InstanceCgroup>,
        withheld: Vec<String>,
        live: Arc<LiveSet>,
    ) -> Self {
        let workspace = paths.workspace();
        let workdir = launcher.workdir(&paths, &config.policy);
        Self {
            id: config.id.to_string(),
            request_id: config.request_id,
            policy: config.policy,
            paths,
            workspace,
            workdir,
            launcher,
            live,
            created_at: SystemTime::now(),
            state: InstanceState::Ready,
            pgid: None,
            cgroup,
            withheld,
        }
    }

    /// Host path of this instance's directory tree.
    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    /// Map `argv[0]` to the path handed to the launcher.
    ///
    /// Bare names must be allowed binaries; paths must stay inside the
    /// workdir. Everything else is blocked before execution.
    fn resolve_program(&self, program: &str) -> Result<PathBuf> {
        if !program.contains('/') {
            if self.withheld.iter().any(|w| w == program) {
                return Err(SandboxError::PolicyViolation(format!(
                    "{program} is blocked on this host; blocked before execution"
                )));
            }
            if !self.policy.allows_binary(program) {
                return Err(SandboxError::PolicyViolation(format!(
                    "{program} is not an allowed binary; blocked before execution"
                )));
            }
            if std::fs::symlink_metadata(self.paths.bin().join(program)).is_err() {
                return Err(SandboxError::ExecFailed(format!(
                    "allowed binary {program} is not installed in the image"
                )));
            }
            return Ok(self.launcher.binary_path(&self.paths, program));
        }

        let path = Path::new(program);
        let inside = path.starts_with(&self.workdir)
            && !path.components().any(|c| c == Component::ParentDir);
        if inside {
            Ok(path.to_path_buf())
        } else {
            Err(SandboxError::PolicyViolation(format!(
                "{program} is outside the workspace; blocked before execution"
            )))
        }
    }

    fn kill_group(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }

    /// Kill whatever escaped the process group.
    async fn kill_contained(&self) {
        if let Some(cgroup) = &self.cgroup
            && let Err(e) = cgroup.kill_all().await
        {
            warn!(id = %self.id, error = %e, "failed to empty instance cgroup");
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn created_at(&self) -> SystemTime {
        self.created_at
    }

    fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn write_file(&self, name: &str, content: &[u8]) -> Result<()> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SandboxError::ExecFailed(format!(
                "invalid workspace file name {name:?}"
            )));
        }
        if self.state == InstanceState::Released {
            return Err(SandboxError::ExecFailed(format!(
                "instance {} already released",
                self.id
            )));
        }
        let path = self.workspace.join(name);
        tokio::fs::write(&path, content).await?;
        if self.launcher.drop_identity {
            let identity = self.launcher.identity;
            nix::unistd::chown(
                &path,
                Some(nix::unistd::Uid::from_raw(identity.uid)),
                Some(nix::unistd::Gid::from_raw(identity.gid)),
            )
            .map_err(|e| SandboxError::Provision(format!("chown {}: {e}", path.display())))?;
        }
        Ok(())
    }

    async fn run(&mut self, request: &ExecRequest<'_>) -> Result<ProcessExit> {
        if self.state != InstanceState::Ready {
            return Err(SandboxError::ExecFailed(format!(
                "instance {} is {}, not ready",
                self.id, self.state
            )));
        }
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| SandboxError::ExecFailed("empty argv".into()))?;
        let program = self.resolve_program(program)?;
        let mut command = self
            .launcher
            .command(&self.paths, &self.policy, &program, args);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            SandboxError::ExecFailed(format!("spawn {}: {e}", program.display()))
        })?;
        self.pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        self.state = InstanceState::Running;
        debug!(id = %self.id, program = %program.display(), pid = ?self.pgid, "program started");

        let stdin_task = child.stdin.take().map(|mut pipe| {
            let input = request.stdin.to_vec();
            tokio::spawn(async move {
                // The program may exit without reading; EPIPE is expected.
                let _ = pipe.write_all(&input).await;
                let _ = pipe.shutdown().await;
            })
        });
        let limit = self.policy.max_output_bytes();
        let (stdout_buf, stdout_task) = spawn_capture(child.stdout.take(), limit);
        let (stderr_buf, stderr_task) = spawn_capture(child.stderr.take(), limit);

        let waited = tokio::select! {
            status = child.wait() => status.map(|s| self.launcher.outcome(s)),
            () = tokio::time::sleep(request.timeout) => Ok(ExitOutcome::TimedOut),
            () = request.cancel.cancelled() => Ok(ExitOutcome::Cancelled),
        };

        // Also sweeps up anything the program left running.
        self.kill_group();
        self.kill_contained().await;
        if !matches!(waited, Ok(ExitOutcome::Exited(_) | ExitOutcome::Signaled(_))) {
            let _ = child.wait().await;
        }
        if let Some(task) = stdin_task {
            task.abort();
        }
        let (stdout, stdout_truncated) = collect(stdout_buf, stdout_task, DRAIN_GRACE).await;
        let (stderr, stderr_truncated) = collect(stderr_buf, stderr_task, DRAIN_GRACE).await;
        self.state = InstanceState::Ready;

        let outcome =
            waited.map_err(|e| SandboxError::ExecFailed(format!("wait for program: {e}")))?;
        let duration = started.elapsed();
        debug!(id = %self.id, ?outcome, ?duration, "program finished");
        Ok(ProcessExit {
            outcome,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration,
        })
    }

    async fn kill(&mut self) {
        self.kill_group();
        self.kill_contained().await;
    }

    async fn release(&mut self) -> Result<()> {
        if self.state == InstanceState::Released {
            return Ok(());
        }
        self.kill_group();
        if let Some(cgroup) = self.cgroup.clone() {
            tokio::task::spawn_blocking(move || cgroup.remove())
                .await
                .map_err(std::io::Error::other)
                .and_then(|removed| removed)
                .map_err(|e| {
                    SandboxError::Io(std::io::Error::new(
                        e.kind(),
                        format!("remove cgroup of {}: {e}", self.id),
                    ))
                })?;
        }
        remove_tree(self.paths.root()).await.map_err(|e| {
            SandboxError::Io(std::io::Error::new(
                e.kind(),
                format!("remove {}: {e}", self.paths.root().display()),
            ))
        })?;
        self.live.remove(&self.id);
        self.state = InstanceState::Released;
        info!(id = %self.id, request_id = %self.request_id, "instance released");
        Ok(())
    }

    fn is_released(&self) -> bool {
        self.state == InstanceState::Released
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        if self.state == InstanceState::Released {
            return;
        }
        self.kill_group();
        if let Some(cgroup) = &self.cgroup
            && let Err(e) = cgroup.remove()
        {
            warn!(id = %self.id, error = %e, "failed to remove cgroup of dropped instance");
        }
        match remove_tree_blocking(self.paths.root()) {
            Ok(()) => {
                self.live.remove(&self.id);
            }
            Err(e) => warn!(id = %self.id, error = %e, "failed to remove dropped instance"),
        }
        warn!(id = %self.id, "instance dropped without release");
    }
}
