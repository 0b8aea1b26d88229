use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SandboxError};

pub const DEFAULT_CPU_TIME_LIMIT_MS: u64 = 5_000;
pub const DEFAULT_WALL_CLOCK_LIMIT_MS: u64 = 10_000;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Matches the `fsize` ulimit of the hardened language images.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 10_000_000;

/// Where the writable workspace appears inside the sandbox when the policy
/// does not declare a writable mount.
pub const DEFAULT_WORKDIR: &str = "/workspace";

/// One filesystem mount exposed to sandboxed programs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
}

fn default_read_only() -> bool {
    true
}

/// Raw, unvalidated policy as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub allowed_binaries: Vec<String>,
    pub cpu_time_limit_ms: u64,
    pub wall_clock_limit_ms: u64,
    pub memory_limit_bytes: u64,
    pub network_enabled: bool,
    pub filesystem_mounts: Vec<MountSpec>,
    /// Per-stream ceiling for captured stdout/stderr.
    pub max_output_bytes: usize,
    pub max_file_size_bytes: Option<u64>,
    pub max_processes: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_binaries: Vec::new(),
            cpu_time_limit_ms: DEFAULT_CPU_TIME_LIMIT_MS,
            wall_clock_limit_ms: DEFAULT_WALL_CLOCK_LIMIT_MS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            network_enabled: false,
            filesystem_mounts: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_file_size_bytes: Some(DEFAULT_MAX_FILE_SIZE_BYTES),
            max_processes: None,
        }
    }
}

/// Validated, immutable description of what a sandboxed run may do.
///
/// Built once by [`load_policy`] and shared behind an `Arc`. There are no
/// setters: changing the policy means loading a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    allowed_binaries: BTreeSet<String>,
    cpu_time_limit: Duration,
    wall_clock_limit: Duration,
    memory_limit_bytes: u64,
    network_enabled: bool,
    filesystem_mounts: Vec<MountSpec>,
    max_output_bytes: usize,
    max_file_size_bytes: Option<u64>,
    max_processes: Option<u64>,
    fingerprint: String,
}

/// Validate a [`PolicyConfig`] into an [`ExecutionPolicy`].
///
/// Every run handled by this crate executes untrusted input, so a policy
/// that enables networking is rejected outright.
pub fn load_policy(config: &PolicyConfig) -> Result<ExecutionPolicy> {
    let positive = [
        ("cpu_time_limit_ms", config.cpu_time_limit_ms),
        ("wall_clock_limit_ms", config.wall_clock_limit_ms),
        ("memory_limit_bytes", config.memory_limit_bytes),
        ("max_output_bytes", config.max_output_bytes as u64),
        ("max_file_size_bytes", config.max_file_size_bytes.unwrap_or(1)),
        ("max_processes", config.max_processes.unwrap_or(1)),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(SandboxError::Config(format!("{name} must be positive")));
        }
    }

    if config.network_enabled {
        return Err(SandboxError::Config(
            "network_enabled must be false for untrusted runs".into(),
        ));
    }

    if config.allowed_binaries.is_empty() {
        return Err(SandboxError::Config("allowed_binaries is empty".into()));
    }
    for name in &config.allowed_binaries {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SandboxError::Config(format!(
                "allowed binary must be a bare program name: {name:?}"
            )));
        }
    }

    let writable = config
        .filesystem_mounts
        .iter()
        .filter(|m| !m.read_only)
        .count();
    if writable > 1 {
        return Err(SandboxError::Config(format!(
            "at most one writable mount (the workspace) is allowed, found {writable}"
        )));
    }
    for mount in &config.filesystem_mounts {
        check_absolute(&mount.host_path, "host_path")?;
        check_absolute(&mount.container_path, "container_path")?;
    }

    let fingerprint = fingerprint(config)?;

    Ok(ExecutionPolicy {
        allowed_binaries: config.allowed_binaries.iter().cloned().collect(),
        cpu_time_limit: Duration::from_millis(config.cpu_time_limit_ms),
        wall_clock_limit: Duration::from_millis(config.wall_clock_limit_ms),
        memory_limit_bytes: config.memory_limit_bytes,
        network_enabled: false,
        filesystem_mounts: config.filesystem_mounts.clone(),
        max_output_bytes: config.max_output_bytes,
        max_file_size_bytes: config.max_file_size_bytes,
        max_processes: config.max_processes,
        fingerprint,
    })
}

fn check_absolute(path: &Path, label: &str) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(SandboxError::Config(format!(
            "mount {label} must be absolute: {}",
            path.display()
        )))
    }
}

/// SHA-256 of the canonical JSON form of the config, used to tell policy
/// snapshots apart in logs and status output.
fn fingerprint(config: &PolicyConfig) -> Result<String> {
    let mut canonical = config.clone();
    canonical.allowed_binaries.sort();
    canonical.allowed_binaries.dedup();
    let json = serde_json::to_vec(&canonical)
        .map_err(|e| SandboxError::Config(format!("serialize policy: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(b"policy:");
    hasher.update(&json);
    Ok(format!("{:x}", hasher.finalize()))
}

impl ExecutionPolicy {
    pub fn allowed_binaries(&self) -> &BTreeSet<String> {
        &self.allowed_binaries
    }

    pub fn allows_binary(&self, name: &str) -> bool {
        self.allowed_binaries.contains(name)
    }

    pub fn cpu_time_limit(&self) -> Duration {
        self.cpu_time_limit
    }

    pub fn wall_clock_limit(&self) -> Duration {
        self.wall_clock_limit
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn network_enabled(&self) -> bool {
        self.network_enabled
    }

    pub fn filesystem_mounts(&self) -> &[MountSpec] {
        &self.filesystem_mounts
    }

    /// The single writable mount, if the policy declares one.
    pub fn workspace_mount(&self) -> Option<&MountSpec> {
        self.filesystem_mounts.iter().find(|m| !m.read_only)
    }

    pub fn read_only_mounts(&self) -> impl Iterator<Item = &MountSpec> {
        self.filesystem_mounts.iter().filter(|m| m.read_only)
    }

    /// Path of the workspace as seen by the sandboxed program.
    pub fn workdir(&self) -> &Path {
        self.workspace_mount()
            .map(|m| m.container_path.as_path())
            .unwrap_or(Path::new(DEFAULT_WORKDIR))
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    pub fn max_file_size_bytes(&self) -> Option<u64> {
        self.max_file_size_bytes
    }

    pub fn max_processes(&self) -> Option<u64> {
        self.max_processes
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
