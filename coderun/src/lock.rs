use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{CoderunError, CoderunResult};

/// Take an exclusive flock on `path` without waiting.
///
/// Fails if another process holds it. The returned guard holds the lock
/// until dropped.
pub async fn try_acquire(path: PathBuf) -> CoderunResult<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CoderunError::Internal(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, e)| match e {
            Errno::EWOULDBLOCK => CoderunError::Config(format!(
                "{} is held by another coderun process",
                path.display()
            )),
            e => CoderunError::Internal(format!("flock {}: {e}", path.display())),
        })
    })
    .await
    .map_err(|e| CoderunError::Internal(format!("lock task: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coderun.lock");

        let guard = try_acquire(path.clone()).await.unwrap();
        assert!(path.exists());
        drop(guard);
    }

    #[tokio::test]
    async fn second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coderun.lock");

        let _guard = try_acquire(path.clone()).await.unwrap();
        let err = try_acquire(path.clone()).await.unwrap_err();
        assert!(err.to_string().contains("another coderun process"), "{err}");
    }

    #[tokio::test]
    async fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coderun.lock");

        let guard = try_acquire(path.clone()).await.unwrap();
        drop(guard);
        let _again = try_acquire(path).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_path_returns_error() {
        let result = try_acquire(PathBuf::from("/nonexistent/dir/coderun.lock")).await;
        assert!(result.is_err());
    }
}
