use std::path::{Path, PathBuf};

/// Where each instance's allowed binaries appear inside a bubblewrap sandbox.
pub const SANDBOX_BIN_DIR: &str = "/sandbox/bin";

/// Factory-level paths derived from the base directory.
pub struct FactoryPaths {
    base_dir: PathBuf,
}

impl FactoryPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Default parent of instance roots, used when the policy declares no
    /// writable mount.
    pub fn instances(&self) -> PathBuf {
        self.base_dir.join("instances")
    }
}

/// Per-instance paths: `<instances>/<id>/{workspace,bin}`.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    root: PathBuf,
}

impl InstancePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The only path a sandboxed program may write to.
    pub fn workspace(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Symlinks to the allowed binaries, nothing else.
    pub fn bin(&self) -> PathBuf {
        self.root.join("bin")
    }
}
