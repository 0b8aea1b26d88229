use std::path::PathBuf;

/// Service-level paths derived from the base directory.
pub struct CoderunPaths {
    base_dir: PathBuf,
}

impl CoderunPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn status(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }

    /// Held exclusively so two processes never share an instances root.
    pub fn lock(&self) -> PathBuf {
        self.base_dir.join("coderun.lock")
    }
}
