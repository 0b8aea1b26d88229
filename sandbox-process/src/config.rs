use std::path::PathBuf;

/// How sandboxed programs are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    /// bubblewrap: fresh user/pid/net/ipc/uts namespaces, read-only root,
    /// a single writable workspace bind.
    Bubblewrap,
    /// Plain child process with rlimits, a restricted `PATH` and (when
    /// running as root) a dropped identity and a private mount namespace
    /// for executable masks. No other isolation: for development and
    /// tests only.
    Host,
}

/// Unprivileged identity sandboxed programs run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// `nobody:nogroup` on most distributions.
pub const NOBODY: Identity = Identity {
    uid: 65534,
    gid: 65534,
};

/// Package managers and network clients that are never linked into an
/// instance, even when the policy allows them.
pub const DEFAULT_BLOCKED_BINARIES: &[&str] = &[
    "apk", "apt", "apt-get", "dpkg", "dnf", "yum", "rpm", "pip", "pip3", "npm", "gem", "curl",
    "wget", "nc", "ncat", "netcat", "socat", "ssh", "scp", "sftp", "telnet", "ftp",
];

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Base directory for runtime data (instance roots).
    pub base_dir: PathBuf,
    pub launcher: LauncherKind,
    pub identity: Identity,
    /// Path to `bwrap`. Looked up on `PATH` when unset.
    pub bwrap_path: Option<PathBuf>,
    /// Deny list that wins over the policy's allow-list.
    pub blocked_binaries: Vec<String>,
}

impl ProcessConfig {
    pub fn new(base_dir: PathBuf, launcher: LauncherKind) -> Self {
        Self {
            base_dir,
            launcher,
            identity: NOBODY,
            bwrap_path: None,
            blocked_binaries: DEFAULT_BLOCKED_BINARIES
                .iter()
                .map(|b| b.to_string())
                .collect(),
        }
    }
}
