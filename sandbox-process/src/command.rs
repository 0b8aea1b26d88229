use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Execute a host command directly (no shell).
///
/// Returns trimmed stdout on success.
pub async fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let cmd_display = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    trace!(command = %cmd_display, "exec");

    let output = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: cmd_display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let output = exec("echo", &["hello"]).await.unwrap();
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn exec_returns_error_on_failure() {
        let err = exec("false", &[]).await.unwrap_err();
        assert!(err.command.contains("false"), "command was: {}", err.command);
    }

    #[tokio::test]
    async fn exec_error_contains_stderr() {
        let err = exec("sh", &["-c", "echo oops >&2; exit 1"])
            .await
            .unwrap_err();
        assert!(err.detail.contains("oops"), "detail was: {}", err.detail);
    }

    #[tokio::test]
    async fn exec_missing_program() {
        let err = exec("definitely-not-a-real-program", &[]).await.unwrap_err();
        assert!(!err.detail.is_empty());
    }
}
