use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{
    ExecutionPolicy, ImageRegistry, PolicyConfig, RegistryBuilder, SandboxImage, load_policy,
};
use sandbox_process::{DEFAULT_BLOCKED_BINARIES, Identity, LauncherKind, NOBODY, ProcessConfig};
use serde::{Deserialize, Serialize};

use crate::error::{CoderunError, CoderunResult};
use crate::executor::Admission;
use crate::presets;

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct CoderunConfig {
    pub base_dir: PathBuf,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Path to `bwrap`. Looked up on `PATH` when absent.
    #[serde(default)]
    pub bwrap: Option<PathBuf>,
    /// Never linked into an instance, even when allowed.
    #[serde(default = "default_blocked_binaries")]
    pub blocked_binaries: Vec<String>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Language images. The built-in presets are used when empty.
    #[serde(default)]
    pub languages: Vec<SandboxImage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherConfig {
    #[default]
    Bubblewrap,
    /// No namespace isolation. Development and tests only.
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub uid: u32,
    pub gid: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            uid: NOBODY.uid,
            gid: NOBODY.gid,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_concurrent: usize,
    pub admission: AdmissionConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            admission: AdmissionConfig::default(),
        }
    }
}

/// What happens to a request arriving while every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AdmissionConfig {
    Reject,
    Queue {
        #[serde(default = "default_queue_timeout_ms")]
        timeout_ms: u64,
    },
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::Queue {
            timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
        }
    }
}

fn default_queue_timeout_ms() -> u64 {
    DEFAULT_QUEUE_TIMEOUT_MS
}

fn default_blocked_binaries() -> Vec<String> {
    DEFAULT_BLOCKED_BINARIES
        .iter()
        .map(|b| b.to_string())
        .collect()
}

/// Load a config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> CoderunResult<CoderunConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CoderunError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: CoderunConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| CoderunError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    if config.limits.max_concurrent == 0 {
        return Err(CoderunError::Config(
            "limits.max_concurrent must be positive".into(),
        ));
    }
    Ok(config)
}

impl CoderunConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.base_dir);
        if let Some(bwrap) = &mut self.bwrap {
            resolve(bwrap);
        }
        for mount in &mut self.policy.filesystem_mounts {
            resolve(&mut mount.host_path);
        }
        for image in &mut self.languages {
            if !image.uses_host_root() && Path::new(&image.image_reference).is_relative() {
                image.image_reference = config_dir
                    .join(&image.image_reference)
                    .to_string_lossy()
                    .into_owned();
            }
        }
    }

    /// Validate the policy, filling in the default allow-list when empty.
    pub fn execution_policy(&self) -> CoderunResult<ExecutionPolicy> {
        let mut policy = self.policy.clone();
        if policy.allowed_binaries.is_empty() {
            policy.allowed_binaries = presets::DEFAULT_ALLOWED_BINARIES
                .iter()
                .map(|b| b.to_string())
                .collect();
        }
        Ok(load_policy(&policy)?)
    }

    /// Build and freeze the image registry, checking every image against `policy`.
    pub fn image_registry(&self, policy: &ExecutionPolicy) -> CoderunResult<ImageRegistry> {
        let images = if self.languages.is_empty() {
            presets::images()?
        } else {
            self.languages.clone()
        };
        let mut builder = RegistryBuilder::new();
        for image in images {
            builder.register(image)?;
        }
        let registry = builder.freeze();
        registry.check_policy(policy)?;
        Ok(registry)
    }

    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            base_dir: self.base_dir.clone(),
            launcher: match self.launcher {
                LauncherConfig::Bubblewrap => LauncherKind::Bubblewrap,
                LauncherConfig::Host => LauncherKind::Host,
            },
            identity: Identity {
                uid: self.identity.uid,
                gid: self.identity.gid,
            },
            bwrap_path: self.bwrap.clone(),
            blocked_binaries: self.blocked_binaries.clone(),
        }
    }

    pub fn admission(&self) -> Admission {
        match self.limits.admission {
            AdmissionConfig::Reject => Admission::Reject,
            AdmissionConfig::Queue { timeout_ms } => {
                Admission::Queue(Duration::from_millis(timeout_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("coderun.yaml");
        tokio::fs::write(&path, yaml).await.unwrap();
        path
    }

    #[tokio::test]
    async fn load_minimal_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "base_dir: /var/lib/coderun\n").await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.launcher, LauncherConfig::Bubblewrap);
        assert_eq!(config.identity, IdentityConfig { uid: 65534, gid: 65534 });
        assert_eq!(config.limits.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(
            config.admission(),
            Admission::Queue(Duration::from_millis(DEFAULT_QUEUE_TIMEOUT_MS))
        );
        assert!(config.blocked_binaries.iter().any(|b| b == "curl"));

        let policy = config.execution_policy().unwrap();
        assert!(policy.allows_binary("g++"));
        let registry = config.image_registry(&policy).unwrap();
        assert!(registry.resolve("cpp").is_ok());
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: runtime
launcher: host
identity:
  uid: 1500
  gid: 1500
bwrap: tools/bwrap
limits:
  max_concurrent: 2
  admission:
    mode: reject
policy:
  allowed_binaries: [python3]
  wall_clock_limit_ms: 3000
  filesystem_mounts:
    - host_path: runs
      container_path: /app
      read_only: false
languages:
  - language_id: python
    aliases: [py]
    source_file: main.py
    entrypoint_template: python3 {source}
"#;
        let path = write_config(dir.path(), yaml).await;

        let config = load(&path).await.unwrap();
        assert_eq!(config.base_dir, dir.path().join("runtime"));
        assert_eq!(config.bwrap, Some(dir.path().join("tools/bwrap")));
        assert_eq!(config.admission(), Admission::Reject);
        assert_eq!(
            config.policy.filesystem_mounts[0].host_path,
            dir.path().join("runs")
        );

        let process = config.process_config();
        assert_eq!(process.launcher, LauncherKind::Host);
        assert_eq!(process.identity.uid, 1500);

        let policy = config.execution_policy().unwrap();
        assert_eq!(policy.wall_clock_limit(), Duration::from_secs(3));
        assert_eq!(policy.workdir(), Path::new("/app"));
        let registry = config.image_registry(&policy).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("cpp").is_err());
    }

    #[tokio::test]
    async fn image_outside_policy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: /tmp/x
policy:
  allowed_binaries: [python3]
"#;
        let path = write_config(dir.path(), yaml).await;
        let config = load(&path).await.unwrap();
        let policy = config.execution_policy().unwrap();
        // Presets need g++, javac, node...
        let err = config.image_registry(&policy).unwrap_err();
        assert!(err.to_string().contains("not in allowed_binaries"), "{err}");
    }

    #[tokio::test]
    async fn network_policy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "base_dir: /tmp/x\npolicy:\n  network_enabled: true\n";
        let path = write_config(dir.path(), yaml).await;
        let config = load(&path).await.unwrap();
        assert!(config.execution_policy().is_err());
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "base_dir: /tmp/x\nlimits:\n  max_concurrent: 0\n";
        let path = write_config(dir.path(), yaml).await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("max_concurrent"), "{err}");
    }

    #[tokio::test]
    async fn unknown_launcher_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "base_dir: /x\nlauncher: docker\n").await;
        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("parse"), "{err}");
    }
}
