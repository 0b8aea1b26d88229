use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use sandbox::{ExecutionPolicy, ExitOutcome};
use tokio::process::Command;

use crate::cgroup;
use crate::config::{Identity, LauncherKind};
use crate::mask::HostMasks;
use crate::paths::{InstancePaths, SANDBOX_BIN_DIR};
use crate::process::{Limits, exit_outcome, switch_identity};

/// Host directories bound read-only when an image reuses the host root.
const HOST_SYSTEM_DIRS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/etc/alternatives",
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/ld.so.conf.d",
    "/etc/localtime",
];

/// Directories searched for binaries inside an image.
pub(crate) const IMAGE_SEARCH_PATH: &[&str] = &[
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/local/sbin",
    "/usr/sbin",
    "/sbin",
];

/// Host path of `path` as seen inside the image.
pub(crate) fn image_path(image_root: Option<&Path>, path: &Path) -> PathBuf {
    match image_root {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
        None => path.to_path_buf(),
    }
}

/// Resolve `name` to the absolute path it has inside the image.
pub(crate) fn resolve_binary(image_root: Option<&Path>, name: &str) -> Option<PathBuf> {
    let search = std::env::join_paths(
        IMAGE_SEARCH_PATH
            .iter()
            .map(|dir| image_path(image_root, Path::new(dir))),
    )
    .ok()?;
    let cwd = image_root.unwrap_or(Path::new("/"));
    let found = which::which_in(name, Some(search), cwd).ok()?;
    match image_root {
        Some(root) => found
            .strip_prefix(root)
            .ok()
            .map(|p| Path::new("/").join(p)),
        None => Some(found),
    }
}

/// Builds the command that launches one program for an instance.
#[derive(Debug, Clone)]
pub(crate) struct Launcher {
    pub(crate) kind: LauncherKind,
    pub(crate) bwrap: PathBuf,
    pub(crate) identity: Identity,
    /// Host launcher only: switch to `identity` before exec.
    pub(crate) drop_identity: bool,
    /// Prebuilt root filesystem, or `None` to reuse the host's system dirs.
    pub(crate) image_root: Option<PathBuf>,
    /// bubblewrap: search-path entries hidden behind `/dev/null`.
    pub(crate) masked: Vec<PathBuf>,
    /// Host launcher: the same masks, applied in a private mount namespace.
    pub(crate) host_masks: Option<HostMasks>,
    /// `cgroup.procs` of the instance cgroup the program joins.
    pub(crate) cgroup_procs: Option<Arc<File>>,
}

impl Launcher {
    /// The workspace path as the launched program sees it.
    pub(crate) fn workdir(&self, paths: &InstancePaths, policy: &ExecutionPolicy) -> PathBuf {
        match self.kind {
            LauncherKind::Bubblewrap => policy.workdir().to_path_buf(),
            LauncherKind::Host => paths.workspace(),
        }
    }

    /// An allowed binary's path as the launched program sees it.
    pub(crate) fn binary_path(&self, paths: &InstancePaths, name: &str) -> PathBuf {
        match self.kind {
            LauncherKind::Bubblewrap => Path::new(SANDBOX_BIN_DIR).join(name),
            LauncherKind::Host => paths.bin().join(name),
        }
    }

    pub(crate) fn command(
        &self,
        paths: &InstancePaths,
        policy: &ExecutionPolicy,
        program: &Path,
        args: &[String],
    ) -> Command {
        let mut command = match self.kind {
            LauncherKind::Bubblewrap => {
                let mut command = Command::new(&self.bwrap);
                command.args(self.bwrap_args(paths, policy)).arg(program);
                command
            }
            LauncherKind::Host => {
                let workspace = paths.workspace();
                let mut command = Command::new(program);
                command
                    .env_clear()
                    .env("PATH", paths.bin())
                    .env("HOME", &workspace)
                    .env("TMPDIR", &workspace)
                    .env("LANG", "C.UTF-8");
                command
            }
        };
        command
            .args(args)
            .current_dir(paths.workspace())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let limits = Limits::from_policy(policy);
        let cgroup_procs = self.cgroup_procs.clone();
        let host = self.kind == LauncherKind::Host;
        let masks = self.host_masks.clone().filter(|_| host);
        // Switched by hand: `Command::uid` would drop root before the
        // masks are mounted.
        let identity = (host && self.drop_identity).then_some(self.identity);
        // SAFETY: the closure only issues write, unshare, mount, setgroups,
        // setgid, setuid and setrlimit syscalls on data prepared before the
        // fork, and allocates nothing.
        unsafe {
            command.pre_exec(move || {
                if let Some(procs) = &cgroup_procs {
                    cgroup::join(procs)?;
                }
                if let Some(masks) = &masks {
                    masks.apply()?;
                }
                if let Some(identity) = identity {
                    switch_identity(identity)?;
                }
                limits.apply()
            });
        }
        command
    }

    pub(crate) fn outcome(&self, status: ExitStatus) -> ExitOutcome {
        exit_outcome(status, self.kind == LauncherKind::Bubblewrap)
    }

    /// bubblewrap arguments up to and including the `--` separator.
    ///
    /// A prebuilt image must already contain the `/sandbox/bin` and
    /// workdir mount points, since its root is bound read-only.
    pub(crate) fn bwrap_args(&self, paths: &InstancePaths, policy: &ExecutionPolicy) -> Vec<OsString> {
        let workdir = policy.workdir();
        let mut args = Args::default();
        args.flag("--unshare-all")
            .flag("--unshare-user")
            .pair("--uid", self.identity.uid.to_string())
            .pair("--gid", self.identity.gid.to_string())
            .flag("--die-with-parent")
            .flag("--new-session")
            .pair("--cap-drop", "ALL")
            .flag("--clearenv")
            .pair2("--setenv", "PATH", SANDBOX_BIN_DIR)
            .pair2("--setenv", "HOME", workdir)
            .pair2("--setenv", "TMPDIR", "/tmp")
            .pair2("--setenv", "LANG", "C.UTF-8");

        match &self.image_root {
            Some(root) => {
                args.pair2("--ro-bind", root, "/");
            }
            None => {
                for dir in HOST_SYSTEM_DIRS {
                    args.pair2("--ro-bind-try", dir, dir);
                }
            }
        }
        args.pair("--proc", "/proc")
            .pair("--dev", "/dev")
            .pair("--tmpfs", "/tmp");
        for mount in policy.read_only_mounts() {
            args.pair2("--ro-bind", &mount.host_path, &mount.container_path);
        }
        args.pair2("--ro-bind", paths.bin(), SANDBOX_BIN_DIR)
            .pair2("--bind", paths.workspace(), workdir);
        for path in &self.masked {
            args.pair2("--ro-bind", "/dev/null", path);
        }
        args.pair("--chdir", workdir).flag("--");
        args.0
    }
}

#[derive(Default)]
struct Args(Vec<OsString>);

impl Args {
    fn flag(&mut self, flag: &str) -> &mut Self {
        self.0.push(flag.into());
        self
    }

    fn pair(&mut self, flag: &str, value: impl AsRef<OsStr>) -> &mut Self {
        self.0.push(flag.into());
        self.0.push(value.as_ref().to_os_string());
        self
    }

    fn pair2(&mut self, flag: &str, a: impl AsRef<OsStr>, b: impl AsRef<OsStr>) -> &mut Self {
        self.pair(flag, a);
        self.0.push(b.as_ref().to_os_string());
        self
    }
}
