//! JSON-lines serving: one `RunRequest` per input line, one response per
//! output line, each request on its own task.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::CoderunResult;
use crate::executor::Orchestrator;
use crate::report::{Redactor, report};
use crate::types::RunRequest;

/// Requested by the signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Running,
    /// Drain in-flight runs, then rebuild from config.
    Reload,
    /// Cancel in-flight runs, then exit.
    Stop,
}

/// Why [`serve_requests`] returned. In-flight runs have finished in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Eof,
    Reload,
    Stop,
}

/// Spawn the task that owns the output stream. Responses from concurrent
/// runs are serialized through the returned channel, one line each.
pub fn spawn_writer<W>(mut writer: W) -> (mpsc::Sender<String>, JoinHandle<std::io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok(())
    });
    (tx, handle)
}

/// Read requests until EOF or a control change, then wait for every run
/// started here to finish.
pub async fn serve_requests<R>(
    lines: &mut Lines<R>,
    responses: &mpsc::Sender<String>,
    orchestrator: &Arc<Orchestrator>,
    redactor: &Arc<Redactor>,
    control: &mut watch::Receiver<Control>,
) -> CoderunResult<ServeExit>
where
    R: AsyncBufRead + Unpin,
{
    let mut runs = JoinSet::new();
    let stop = CancellationToken::new();

    let exit = loop {
        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    break ServeExit::Stop;
                }
                let requested = *control.borrow_and_update();
                match requested {
                    Control::Running => {}
                    Control::Reload => break ServeExit::Reload,
                    Control::Stop => {
                        stop.cancel();
                        break ServeExit::Stop;
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break ServeExit::Eof;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let request: RunRequest = match serde_json::from_str(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "invalid request line");
                        let reply = serde_json::json!({ "error": format!("invalid request: {e}") });
                        let _ = responses.send(reply.to_string()).await;
                        continue;
                    }
                };
                let orchestrator = Arc::clone(orchestrator);
                let redactor = Arc::clone(redactor);
                let responses = responses.clone();
                let cancel = stop.child_token();
                runs.spawn(async move {
                    let result = orchestrator.execute_with_cancel(&request, cancel).await;
                    match serde_json::to_string(&report(&result, &redactor)) {
                        Ok(line) => {
                            if responses.send(line).await.is_err() {
                                warn!(request_id = %request.request_id, "output closed, response dropped");
                            }
                        }
                        Err(e) => error!(request_id = %request.request_id, error = %e, "failed to serialize response"),
                    }
                });
            }
            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "run task panicked");
                }
            }
        }
    };

    if !runs.is_empty() {
        info!(remaining = runs.len(), "waiting for in-flight runs");
    }
    // A stop that arrives while draining for reload or EOF still cancels.
    loop {
        tokio::select! {
            joined = runs.join_next() => match joined {
                None => break,
                Some(Err(e)) => error!(error = %e, "run task panicked during drain"),
                Some(Ok(())) => {}
            },
            changed = control.changed(), if !stop.is_cancelled() => {
                if changed.is_err() || *control.borrow_and_update() == Control::Stop {
                    stop.cancel();
                }
            }
        }
    }
    Ok(exit)
}
