use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Gid, Pid, Uid, setgid, setgroups, setuid};
use sandbox::{ExecutionPolicy, ExitOutcome};
use tracing::warn;

use crate::config::Identity;

/// Kill an entire process group via `killpg(SIGKILL)`.
///
/// The leader must have been spawned with `process_group(0)` so that its
/// PGID equals its PID. An already-empty group is not an error.
pub(crate) fn kill_process_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "killpg failed"),
    }
}

pub(crate) fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Give up root for `identity` with no supplementary groups.
///
/// Runs in the forked child between `fork` and `exec`.
pub(crate) fn switch_identity(identity: Identity) -> io::Result<()> {
    setgroups(&[])?;
    setgid(Gid::from_raw(identity.gid))?;
    setuid(Uid::from_raw(identity.uid))?;
    Ok(())
}

/// Map a child's wait status to an [`ExitOutcome`].
///
/// bubblewrap reports a signalled child as exit code `128 + signal`, so
/// with `bwrap_status` those codes are read back as signals.
pub(crate) fn exit_outcome(status: ExitStatus, bwrap_status: bool) -> ExitOutcome {
    if let Some(signal) = status.signal() {
        return ExitOutcome::Signaled(signal);
    }
    match status.code() {
        Some(code) if bwrap_status && (129..=192).contains(&code) => {
            ExitOutcome::Signaled(code - 128)
        }
        Some(code) => ExitOutcome::Exited(code),
        None => ExitOutcome::Exited(-1),
    }
}

/// Resource ceilings applied to the launched process before `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    cpu_secs: u64,
    address_space: u64,
    file_size: Option<u64>,
    processes: Option<u64>,
}

impl Limits {
    pub(crate) fn from_policy(policy: &ExecutionPolicy) -> Self {
        let cpu = policy.cpu_time_limit();
        let mut cpu_secs = cpu.as_secs();
        if cpu.subsec_nanos() > 0 || cpu_secs == 0 {
            cpu_secs += 1;
        }
        Self {
            cpu_secs,
            address_space: policy.memory_limit_bytes(),
            file_size: policy.max_file_size_bytes(),
            processes: policy.max_processes(),
        }
    }

    /// Runs in the forked child between `fork` and `exec`: only plain
    /// syscalls, no allocation.
    pub(crate) fn apply(&self) -> io::Result<()> {
        // SIGXCPU at the soft limit, SIGKILL one second later.
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        setrlimit(
            Resource::RLIMIT_AS,
            self.address_space,
            self.address_space,
        )?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(bytes) = self.file_size {
            setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(count) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, count, count)?;
        }
        Ok(())
    }
}

/// Delete an instance tree, first restoring owner permissions on any
/// directory the sandboxed program made unreadable. A missing tree is
/// not an error.
pub(crate) async fn remove_tree(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || remove_tree_blocking(&path))
        .await
        .map_err(io::Error::other)?
}

pub(crate) fn remove_tree_blocking(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(_) => {
            restore_permissions(path);
            match std::fs::remove_dir_all(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        }
    }
}

fn restore_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(meta) = std::fs::symlink_metadata(dir) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            restore_permissions(&entry.path());
        }
    }
}
