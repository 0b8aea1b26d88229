use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use coderun::config::{self, CoderunConfig};
use coderun::error::{CoderunError, CoderunResult};
use coderun::lock;
use coderun::paths::CoderunPaths;
use coderun::runtime::Runtime;
use coderun::server::{Control, ServeExit, serve_requests, spawn_writer};
use coderun::status::{ServiceMode, StatusTracker};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Args)]
pub struct ServeArgs {
    /// Path to coderun.yaml config file
    #[arg(long, short, env = "CODERUN_CONFIG")]
    config: PathBuf,
}

/// Serve JSON-lines requests on stdin until EOF, SIGTERM or SIGINT.
/// SIGHUP drains in-flight runs and reloads the config.
pub async fn run_serve(args: ServeArgs) -> CoderunResult<()> {
    let config = config::load(&args.config).await?;
    tokio::fs::create_dir_all(&config.base_dir)
        .await
        .map_err(|e| {
            CoderunError::Config(format!("create base_dir {}: {e}", config.base_dir.display()))
        })?;
    let paths = CoderunPaths::new(config.base_dir.clone());
    let _lock = lock::try_acquire(paths.lock()).await?;

    let status = Arc::new(StatusTracker::new(paths.status()));
    let mut runtime = Runtime::build(&config, Some(Arc::clone(&status))).await?;
    let mut base_dir = config.base_dir;
    status.write_initial().await;

    // -----------------------------------------------------------------------
    // Signal handling
    // -----------------------------------------------------------------------
    let (control_tx, mut control_rx) = tokio::sync::watch::channel(Control::Running);

    let signal_status = Arc::clone(&status);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        let mut sighup = signal(SignalKind::hangup()).ok();

        loop {
            tokio::select! {
                _ = recv_signal(&mut sigterm) => {
                    info!("received SIGTERM, stopping");
                    signal_status.set_mode(ServiceMode::Draining).await;
                    let _ = control_tx.send(Control::Stop);
                    return;
                }
                _ = recv_signal(&mut sigint) => {
                    info!("received SIGINT, stopping");
                    signal_status.set_mode(ServiceMode::Draining).await;
                    let _ = control_tx.send(Control::Stop);
                    return;
                }
                _ = recv_signal(&mut sighup) => {
                    info!("received SIGHUP, draining for reload");
                    signal_status.set_mode(ServiceMode::Draining).await;
                    let _ = control_tx.send(Control::Reload);
                }
            }
        }
    });

    // -----------------------------------------------------------------------
    // Request loop
    // -----------------------------------------------------------------------
    let (responses, writer) = spawn_writer(tokio::io::stdout());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("serving requests on stdin");

    loop {
        let exit = serve_requests(
            &mut lines,
            &responses,
            &runtime.orchestrator,
            &runtime.redactor,
            &mut control_rx,
        )
        .await;
        match exit {
            Ok(ServeExit::Reload) => {
                status.set_mode(ServiceMode::Reloading).await;
                match reload(&args.config, &base_dir, &status).await {
                    Ok((next, config)) => {
                        runtime.shutdown().await;
                        runtime = next;
                        base_dir = config.base_dir;
                        info!("config reloaded");
                    }
                    Err(e) => error!(error = %e, "reload failed, keeping current config"),
                }
                status.set_mode(ServiceMode::Running).await;
            }
            Ok(ServeExit::Eof) => {
                info!("input closed");
                break;
            }
            Ok(ServeExit::Stop) => break,
            Err(e) => {
                error!(error = %e, "reading requests failed");
                break;
            }
        }
    }

    drop(responses);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "writing responses failed"),
        Err(e) => error!(error = %e, "response writer panicked"),
    }

    info!("shutting down provisioner");
    runtime.shutdown().await;
    status.set_mode(ServiceMode::Stopped).await;
    info!("coderun stopped");
    Ok(())
}

/// Build a fresh runtime from the config file. The new provisioner starts
/// with its breaker reset.
async fn reload(
    path: &std::path::Path,
    base_dir: &std::path::Path,
    status: &Arc<StatusTracker>,
) -> CoderunResult<(Runtime, CoderunConfig)> {
    let config = config::load(path).await?;
    if config.base_dir != base_dir {
        return Err(CoderunError::Config(format!(
            "base_dir cannot change on reload ({} -> {})",
            base_dir.display(),
            config.base_dir.display()
        )));
    }
    let runtime = Runtime::build(&config, Some(Arc::clone(status))).await?;
    Ok((runtime, config))
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
