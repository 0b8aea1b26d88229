use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use sandbox::SandboxError;

use crate::command::exec;
use crate::config::{LauncherKind, ProcessConfig};
use crate::mask::HostMasks;
use crate::process::is_root;

/// The bubblewrap binary to use: the configured path, or `bwrap` on `PATH`.
pub(crate) fn bwrap_binary(config: &ProcessConfig) -> Option<PathBuf> {
    config
        .bwrap_path
        .clone()
        .or_else(|| which::which("bwrap").ok())
}

/// Verify the host can provide the isolation the configured launcher
/// promises before the factory is created.
///
/// Collects all failures and returns them in a single `Provision` error.
pub async fn check_prerequisites(config: &ProcessConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_base_dir(&config.base_dir, &mut errors);
    check_identity(config, &mut errors);
    if config.launcher == LauncherKind::Bubblewrap {
        match bwrap_binary(config) {
            Some(bwrap) => {
                check_executable(&bwrap, "bwrap", &mut errors);
                check_namespaces(&bwrap, &mut errors).await;
            }
            None => errors.push("bwrap not found on PATH".to_string()),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::Provision(errors.join("; ")))
    }
}

fn check_base_dir(base_dir: &Path, errors: &mut Vec<String>) {
    if !base_dir.is_absolute() {
        errors.push(format!("base_dir must be absolute: {}", base_dir.display()));
    } else if base_dir.exists() && !base_dir.is_dir() {
        errors.push(format!("base_dir is not a directory: {}", base_dir.display()));
    }
}

fn check_identity(config: &ProcessConfig, errors: &mut Vec<String>) {
    if config.identity.uid == 0 || config.identity.gid == 0 {
        errors.push("refusing to run untrusted code as uid/gid 0".to_string());
    }
    if config.launcher == LauncherKind::Host && !is_root() {
        // Cannot switch identity; programs run as the service user.
        tracing::warn!("host launcher without root keeps the service identity");
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    match path.metadata() {
        Ok(meta) if meta.permissions().mode() & 0o111 == 0 => {
            errors.push(format!("{label} is not executable: {}", path.display()));
        }
        Ok(_) => {}
        Err(e) => errors.push(format!("{label} not found: {}: {e}", path.display())),
    }
}

/// Run `true` under an empty set of host masks to prove the host launcher
/// can give its children a private mount namespace.
pub(crate) async fn host_masking_available() -> bool {
    if !is_root() {
        return false;
    }
    let Ok(program) = which::which("true") else {
        return false;
    };
    let masks = HostMasks::default();
    let mut command = tokio::process::Command::new(program);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: `HostMasks::apply` issues unshare and mount syscalls only.
    unsafe {
        command.pre_exec(move || masks.apply());
    }
    matches!(command.status().await, Ok(status) if status.success())
}

/// Launch a trivial sandbox to prove unprivileged user namespaces work.
async fn check_namespaces(bwrap: &Path, errors: &mut Vec<String>) {
    let program = bwrap.to_string_lossy();
    let trial = exec(
        &program,
        &[
            "--unshare-all",
            "--unshare-user",
            "--die-with-parent",
            "--ro-bind",
            "/",
            "/",
            "true",
        ],
    )
    .await;
    if let Err(e) = trial {
        errors.push(format!("bubblewrap cannot create namespaces: {}", e.detail));
    }
}
