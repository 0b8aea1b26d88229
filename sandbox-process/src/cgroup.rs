//! Per-instance cgroup v2 containment.
//!
//! A launched program joins its instance's cgroup before `exec`, so every
//! descendant stays accounted for even after `setsid` moves it out of the
//! process group.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Prefix of instance cgroup names; the rest is the instance uuid.
pub(crate) const CGROUP_PREFIX: &str = "coderun-";

/// How long a kill waits for the kernel to report the cgroup empty.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where instance cgroups are created: the service's own cgroup in the
/// unified hierarchy.
#[derive(Debug, Clone)]
pub(crate) struct CgroupParent {
    dir: PathBuf,
}

impl CgroupParent {
    /// Locate a writable cgroup v2 parent, or `None` when the host has no
    /// unified hierarchy or the service may not create children in it.
    pub(crate) fn detect() -> Option<Self> {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").ok()?;
        let own = std::fs::read_to_string("/proc/self/cgroup").ok()?;
        let dir = unified_dir(&mountinfo, &own)?;
        if !dir.join("cgroup.procs").is_file() {
            return None;
        }

        let trial = dir.join(format!("{CGROUP_PREFIX}{}", uuid::Uuid::new_v4()));
        match std::fs::create_dir(&trial) {
            Ok(()) => {
                let _ = std::fs::remove_dir(&trial);
                Some(Self { dir })
            }
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "cgroup v2 parent not writable");
                None
            }
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cgroup for instance `id`.
    pub(crate) fn create(&self, id: &str) -> io::Result<InstanceCgroup> {
        let dir = self.dir.join(format!("{CGROUP_PREFIX}{id}"));
        std::fs::create_dir(&dir)?;
        let procs = match OpenOptions::new().write(true).open(dir.join("cgroup.procs")) {
            Ok(procs) => procs,
            Err(e) => {
                let _ = std::fs::remove_dir(&dir);
                return Err(e);
            }
        };
        Ok(InstanceCgroup {
            dir,
            procs: Arc::new(procs),
        })
    }

    /// Kill and remove the cgroups of instances `ids`.
    pub(crate) fn reclaim(&self, ids: &[String]) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut reclaimed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix(CGROUP_PREFIX)) else {
                continue;
            };
            if !ids.iter().any(|wanted| wanted == id) {
                continue;
            }
            match remove_cgroup(&entry.path()) {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to reclaim cgroup"),
            }
        }
        reclaimed
    }
}

/// Mount point of the unified hierarchy joined with this process's path in
/// it, from `/proc/self/mountinfo` and `/proc/self/cgroup` contents.
fn unified_dir(mountinfo: &str, own_cgroup: &str) -> Option<PathBuf> {
    let mount_point = mountinfo.lines().find_map(|line| {
        let (fields, tail) = line.split_once(" - ")?;
        if tail.split_whitespace().next()? != "cgroup2" {
            return None;
        }
        fields.split_whitespace().nth(4).map(PathBuf::from)
    })?;
    let relative = own_cgroup
        .lines()
        .find_map(|line| line.strip_prefix("0::"))?
        .trim()
        .trim_start_matches('/');
    Some(mount_point.join(relative))
}

/// One instance's cgroup. The `cgroup.procs` handle is opened up front so
/// the forked child can join with a single `write`.
#[derive(Debug, Clone)]
pub(crate) struct InstanceCgroup {
    dir: PathBuf,
    procs: Arc<File>,
}

impl InstanceCgroup {
    pub(crate) fn procs(&self) -> Arc<File> {
        Arc::clone(&self.procs)
    }

    /// SIGKILL every member and wait until the kernel reports it empty.
    pub(crate) async fn kill_all(&self) -> io::Result<()> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || kill_members(&dir))
            .await
            .map_err(io::Error::other)?
    }

    /// Empty and delete the cgroup. A missing cgroup is not an error.
    pub(crate) fn remove(&self) -> io::Result<()> {
        remove_cgroup(&self.dir)
    }
}

/// Move the calling process into the cgroup behind `procs`.
///
/// Runs in the forked child between `fork` and `exec`: one `write`, no
/// allocation.
pub(crate) fn join(procs: &File) -> io::Result<()> {
    nix::unistd::write(procs, b"0")?;
    Ok(())
}

fn remove_cgroup(dir: &Path) -> io::Result<()> {
    match kill_members(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        other => other?,
    }
    match std::fs::remove_dir(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn kill_members(dir: &Path) -> io::Result<()> {
    if !populated(dir)? {
        return Ok(());
    }
    match std::fs::write(dir.join("cgroup.kill"), b"1") {
        Ok(()) => {}
        // Kernels before 5.14 have no cgroup.kill.
        Err(e) if e.kind() == io::ErrorKind::NotFound => signal_members(dir)?,
        Err(e) => return Err(e),
    }

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while populated(dir)? {
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("cgroup {} still populated", dir.display()),
            ));
        }
        // Members forked after the first sweep.
        signal_members(dir)?;
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn signal_members(dir: &Path) -> io::Result<()> {
    let procs = std::fs::read_to_string(dir.join("cgroup.procs"))?;
    for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn populated(dir: &Path) -> io::Result<bool> {
    let events = std::fs::read_to_string(dir.join("cgroup.events"))?;
    Ok(events
        .lines()
        .any(|line| line.trim() == "populated 1"))
}
