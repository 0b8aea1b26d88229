use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sandbox::{ExecutionPolicy, Sandbox, SandboxConfig, SandboxError, SandboxFactory, SandboxImage};
use tracing::{debug, error, info, warn};

use crate::cgroup::{CgroupParent, InstanceCgroup};
use crate::config::{LauncherKind, ProcessConfig};
use crate::launcher::{Launcher, resolve_binary};
use crate::live::LiveSet;
use crate::mask::{HostMasks, MaskTarget, masked_executables};
use crate::paths::{FactoryPaths, InstancePaths};
use crate::prerequisites::{bwrap_binary, check_prerequisites, host_masking_available};
use crate::process::{is_root, remove_tree};
use crate::sandbox::ProcessSandbox;

const HALTED: &str = "provisioning halted after an isolation breach; reset required";

pub struct ProcessFactory {
    config: ProcessConfig,
    factory_paths: FactoryPaths,
    bwrap: PathBuf,
    live: Arc<LiveSet>,
    halted: AtomicBool,
    started: bool,
    /// Parent of instance cgroups; `None` without a writable cgroup v2.
    cgroups: Option<CgroupParent>,
    /// Host launcher: masks can be mounted in the child.
    host_masking: bool,
}

impl ProcessFactory {
    /// Create a new factory without touching the filesystem.
    /// Call `startup()` before use.
    pub async fn new(config: ProcessConfig) -> Result<Self, SandboxError> {
        check_prerequisites(&config).await?;
        let bwrap = bwrap_binary(&config).unwrap_or_default();
        let factory_paths = FactoryPaths::new(config.base_dir.clone());
        Ok(Self {
            config,
            factory_paths,
            bwrap,
            live: Arc::new(LiveSet::default()),
            halted: AtomicBool::new(false),
            started: false,
            cgroups: None,
            host_masking: false,
        })
    }

    /// Every process a program starts, including ones that call `setsid`,
    /// is killed when its run ends.
    pub fn contains_processes(&self) -> bool {
        self.cgroups.is_some()
    }

    /// Search-path executables outside the allow-list are hidden from
    /// launched programs.
    pub fn masks_executables(&self) -> bool {
        match self.config.launcher {
            LauncherKind::Bubblewrap => true,
            LauncherKind::Host => self.host_masking,
        }
    }

    /// Parent directory of instance roots under `policy`.
    pub fn instances_root(&self, policy: &ExecutionPolicy) -> PathBuf {
        policy
            .workspace_mount()
            .map(|m| m.host_path.clone())
            .unwrap_or_else(|| self.factory_paths.instances())
    }

    /// Halt provisioning and build the error returned to the caller.
    fn trip(&self, reason: String) -> SandboxError {
        self.halted.store(true, Ordering::SeqCst);
        error!(reason = %reason, "isolation breach, provisioning halted");
        SandboxError::PolicyViolation(reason)
    }

    /// Refuse to provision anything that would weaken isolation.
    fn check_isolation(&self, policy: &ExecutionPolicy, instances: &Path) -> Result<(), SandboxError> {
        if policy.network_enabled() {
            return Err(self.trip("network access requested for an untrusted run".into()));
        }
        for mount in policy.read_only_mounts() {
            if mount.host_path.starts_with(instances) || instances.starts_with(&mount.host_path) {
                return Err(self.trip(format!(
                    "read-only mount {} exposes sandbox workspaces",
                    mount.host_path.display()
                )));
            }
        }
        if let Ok(cwd) = std::env::current_dir()
            && cwd.starts_with(instances)
        {
            return Err(self.trip(format!(
                "instances root {} contains the service's working directory",
                instances.display()
            )));
        }
        Ok(())
    }

    fn image_root(&self, image: &SandboxImage) -> Result<Option<PathBuf>, SandboxError> {
        if image.uses_host_root() {
            return Ok(None);
        }
        if self.config.launcher == LauncherKind::Host {
            return Err(SandboxError::Provision(format!(
                "{}: the host launcher cannot use image {}",
                image.language_id, image.image_reference
            )));
        }
        let root = PathBuf::from(&image.image_reference);
        if !root.is_absolute() || !root.is_dir() {
            return Err(SandboxError::Provision(format!(
                "{}: image root {} is not a directory",
                image.language_id, image.image_reference
            )));
        }
        Ok(Some(root))
    }

    fn drop_identity(&self) -> bool {
        self.config.launcher == LauncherKind::Host && is_root()
    }

    fn is_blocked(&self, name: &str) -> bool {
        self.config.blocked_binaries.iter().any(|b| b == name)
    }

    /// Create workspace and bin dirs and link the allowed binaries that
    /// are not blocked.
    async fn populate(
        &self,
        paths: &InstancePaths,
        policy: &ExecutionPolicy,
        image_root: Option<&Path>,
    ) -> Result<(), SandboxError> {
        let io = |what: &str, e: std::io::Error| SandboxError::Provision(format!("{what}: {e}"));

        tokio::fs::create_dir(paths.workspace())
            .await
            .map_err(|e| io("mkdir workspace", e))?;
        tokio::fs::create_dir(paths.bin())
            .await
            .map_err(|e| io("mkdir bin", e))?;

        for name in policy.allowed_binaries() {
            if self.is_blocked(name) {
                continue;
            }
            match resolve_binary(image_root, name) {
                Some(target) => tokio::fs::symlink(&target, paths.bin().join(name))
                    .await
                    .map_err(|e| io("link binary", e))?,
                None => debug!(binary = %name, "allowed binary not present in image"),
            }
        }
        set_mode(&paths.bin(), 0o555).await?;

        if self.drop_identity() {
            let identity = self.config.identity;
            nix::unistd::chown(
                &paths.workspace(),
                Some(nix::unistd::Uid::from_raw(identity.uid)),
                Some(nix::unistd::Gid::from_raw(identity.gid)),
            )
            .map_err(|e| SandboxError::Provision(format!("chown workspace: {e}")))?;
        }
        set_mode(&paths.workspace(), 0o700).await
    }

    /// Masks for the launcher: `(bubblewrap list, host mounts)`.
    async fn masks(
        &self,
        policy: &ExecutionPolicy,
        image_root: Option<&Path>,
    ) -> Result<(Vec<PathBuf>, Option<HostMasks>), SandboxError> {
        let target = match self.config.launcher {
            LauncherKind::Bubblewrap => MaskTarget::Listed,
            LauncherKind::Host if self.host_masking => MaskTarget::Resolved,
            LauncherKind::Host => return Ok((Vec::new(), None)),
        };
        let keep: Vec<String> = policy
            .allowed_binaries()
            .iter()
            .filter(|name| !self.is_blocked(name))
            .cloned()
            .collect();
        let image_root = image_root.map(Path::to_path_buf);
        let masked = tokio::task::spawn_blocking(move || {
            masked_executables(image_root.as_deref(), keep.iter().map(String::as_str), target)
        })
        .await
        .map_err(|e| SandboxError::Provision(format!("list executables: {e}")))?;

        match target {
            MaskTarget::Listed => Ok((masked, None)),
            MaskTarget::Resolved => {
                let host = HostMasks::new(&masked)
                    .map_err(|e| SandboxError::Provision(format!("mask executables: {e}")))?;
                debug!(masks = host.len(), "host executable masks prepared");
                Ok((Vec::new(), Some(host)))
            }
        }
    }

    /// Kill and remove the cgroups of instances `ids`; returns how many.
    async fn reclaim_cgroups(&self, ids: Vec<String>) -> usize {
        let Some(cgroups) = self.cgroups.clone() else {
            return 0;
        };
        if ids.is_empty() {
            return 0;
        }
        tokio::task::spawn_blocking(move || cgroups.reclaim(&ids))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "cgroup reclaim task failed");
                0
            })
    }

    /// Undo a partially provisioned instance.
    async fn abandon(&self, id: &str, paths: &InstancePaths, cgroup: Option<&InstanceCgroup>) {
        if let Some(cgroup) = cgroup
            && let Err(e) = cgroup.remove()
        {
            warn!(id = %id, error = %e, "failed to remove partial instance cgroup");
        }
        if let Err(e) = remove_tree(paths.root()).await {
            warn!(id = %id, error = %e, "failed to remove partial instance");
        }
        self.live.remove(id);
    }

    /// Remove instance directories and cgroups a previous process left
    /// behind.
    async fn reclaim_orphans(&self) -> Result<(), SandboxError> {
        let instances = self.factory_paths.instances();
        let mut entries = match tokio::fs::read_dir(&instances).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SandboxError::Provision(format!("read {}: {e}", instances.display()))),
        };
        let mut orphans = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if uuid::Uuid::parse_str(&name).is_ok() {
                orphans.push((name, entry.path()));
            }
        }

        // Processes first, so nothing recreates files under the trees.
        let ids = orphans.iter().map(|(id, _)| id.clone()).collect();
        let killed = self.reclaim_cgroups(ids).await;
        if killed > 0 {
            info!(killed, "removed orphaned instance cgroups");
        }

        let mut reclaimed = 0usize;
        for (_, path) in &orphans {
            match remove_tree(path).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to reclaim orphan"),
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "removed orphaned instances");
        }
        Ok(())
    }
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), SandboxError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| SandboxError::Provision(format!("chmod {}: {e}", path.display())))
}

#[async_trait]
impl SandboxFactory for ProcessFactory {
    fn name(&self) -> &str {
        match self.config.launcher {
            LauncherKind::Bubblewrap => "bubblewrap",
            LauncherKind::Host => "host",
        }
    }

    async fn startup(&mut self) -> sandbox::Result<()> {
        if self.started {
            return Err(SandboxError::Provision("factory already started".into()));
        }
        let instances = self.factory_paths.instances();
        tokio::fs::create_dir_all(&instances)
            .await
            .map_err(|e| SandboxError::Provision(format!("mkdir {}: {e}", instances.display())))?;
        // Traversable by the sandbox identity, not listable.
        set_mode(&instances, 0o711).await?;

        self.cgroups = CgroupParent::detect();
        match &self.cgroups {
            Some(cgroups) => debug!(parent = %cgroups.dir().display(), "instance cgroups enabled"),
            None => warn!(
                "no writable cgroup v2 hierarchy; processes that leave their process group are not contained"
            ),
        }
        self.reclaim_orphans().await?;

        if self.config.launcher == LauncherKind::Host {
            warn!("host launcher gives no pid, network or user isolation; use it for development and tests only");
            self.host_masking = host_masking_available().await;
            if !self.host_masking {
                warn!("host launcher cannot mount masks; tools outside the allow-list stay reachable by absolute path");
            }
        }
        debug!(blocked = ?self.config.blocked_binaries, "blocked binaries are never linked");
        self.started = true;
        info!(
            launcher = self.name(),
            base_dir = %self.factory_paths.base_dir().display(),
            "factory started"
        );
        Ok(())
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if self.is_halted() {
            return Err(SandboxError::PolicyViolation(HALTED.into()));
        }
        if !self.started {
            return Err(SandboxError::Provision("factory not started".into()));
        }
        let id = config.id.to_string();
        let instances = self.instances_root(&config.policy);
        self.check_isolation(&config.policy, &instances)?;
        let image_root = self.image_root(&config.image)?;

        tokio::fs::create_dir_all(&instances)
            .await
            .map_err(|e| SandboxError::Provision(format!("mkdir {}: {e}", instances.display())))?;
        let paths = InstancePaths::new(instances.join(&id));
        match tokio::fs::create_dir(paths.root()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(self.trip(format!(
                    "instance root {} already exists",
                    paths.root().display()
                )));
            }
            Err(e) => return Err(SandboxError::Provision(format!("mkdir instance: {e}"))),
        }
        if !self.live.insert(&id, paths.root()) {
            if let Err(rm) = remove_tree(paths.root()).await {
                warn!(id = %id, error = %rm, "failed to remove rejected instance");
            }
            return Err(self.trip(format!(
                "instance root {} overlaps a live instance",
                paths.root().display()
            )));
        }

        let cgroup = match &self.cgroups {
            Some(cgroups) => match cgroups.create(&id) {
                Ok(cgroup) => Some(cgroup),
                Err(e) => {
                    self.abandon(&id, &paths, None).await;
                    return Err(SandboxError::Provision(format!("create instance cgroup: {e}")));
                }
            },
            None => None,
        };

        let prepared = match self
            .populate(&paths, &config.policy, image_root.as_deref())
            .await
        {
            Ok(()) => self.masks(&config.policy, image_root.as_deref()).await,
            Err(e) => Err(e),
        };
        let (masked, host_masks) = match prepared {
            Ok(masks) => masks,
            Err(e) => {
                self.abandon(&id, &paths, cgroup.as_ref()).await;
                return Err(e);
            }
        };
        let withheld: Vec<String> = config
            .policy
            .allowed_binaries()
            .iter()
            .filter(|name| self.is_blocked(name))
            .cloned()
            .collect();
        if !withheld.is_empty() {
            warn!(id = %id, binaries = ?withheld, "allowed binaries are blocked on this host");
        }

        let launcher = Launcher {
            kind: self.config.launcher,
            bwrap: self.bwrap.clone(),
            identity: self.config.identity,
            drop_identity: self.drop_identity(),
            image_root,
            masked,
            host_masks,
            cgroup_procs: cgroup.as_ref().map(InstanceCgroup::procs),
        };
        info!(id = %id, request_id = %config.request_id, language = %config.image.language_id, "sandbox created");
        Ok(Box::new(ProcessSandbox::new(
            config,
            paths,
            launcher,
            cgroup,
            withheld,
            Arc::clone(&self.live),
        )))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) {
        let mut sandbox =
            match (sandbox as Box<dyn std::any::Any>).downcast::<ProcessSandbox>() {
                Ok(s) => s,
                Err(_) => {
                    warn!("destroy called with a foreign sandbox, ignoring");
                    return;
                }
            };
        let id = sandbox.id().to_string();
        if let Err(e) = sandbox.release().await {
            // Dropping retries the removal synchronously.
            warn!(id = %id, error = %e, "failed to release sandbox");
        }
        info!(id = %id, "sandbox destroyed");
    }

    fn live_count(&self) -> usize {
        self.live.len()
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn reset_breaker(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("provisioning breaker reset");
        }
    }

    async fn shutdown(&self) {
        let leaked = self.live.snapshot();
        self.reclaim_cgroups(leaked.iter().map(|(id, _)| id.clone()).collect())
            .await;
        for (id, root) in leaked {
            match remove_tree(&root).await {
                Ok(()) => {
                    self.live.remove(&id);
                    warn!(id = %id, "removed instance left live at shutdown");
                }
                Err(e) => warn!(id = %id, error = %e, "failed to remove instance at shutdown"),
            }
        }
        info!("factory shut down");
    }
}
