use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use sandbox::{
    ExecRequest, ExecutionPolicy, ExitOutcome, ImageRegistry, ProcessExit, Sandbox, SandboxConfig,
    SandboxError, SandboxFactory, SandboxImage, TemplateVars,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::status::StatusTracker;
use crate::types::{RunRequest, RunResult, RunStatus, Stage, Termination};

/// Workspace file the request's stdin is written to (the `{stdin}` placeholder).
pub const STDIN_FILE: &str = "stdin.txt";

/// What to do with a request when every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Fail immediately with `ResourceExhausted`.
    Reject,
    /// Wait up to the given time for a slot.
    Queue(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Provisioning,
    Running,
    Completed,
    TimedOut,
    Crashed,
    Released,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Crashed => "crashed",
            Self::Released => "released",
        };
        f.write_str(s)
    }
}

/// Per-run state machine; every transition is logged.
struct RunTracker<'a> {
    request_id: &'a str,
    state: RunState,
}

impl<'a> RunTracker<'a> {
    fn new(request_id: &'a str) -> Self {
        Self {
            request_id,
            state: RunState::Created,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!(request_id = %self.request_id, from = %self.state, to = %next, "run state");
        self.state = next;
    }
}

/// Why a request never got a run slot.
enum Rejected {
    Busy(String),
    Cancelled,
}

/// Keeps a request id in the status file's active set while a run is in
/// flight, including when the run future is dropped mid-way.
struct ActiveRun {
    status: Arc<StatusTracker>,
    request_id: Option<String>,
}

impl ActiveRun {
    async fn enter(status: Arc<StatusTracker>, request_id: &str) -> Self {
        status.add_run(request_id).await;
        Self {
            status,
            request_id: Some(request_id.to_string()),
        }
    }

    async fn leave(mut self) {
        if let Some(request_id) = self.request_id.take() {
            self.status.remove_run(&request_id).await;
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let Some(request_id) = self.request_id.take() else {
            return;
        };
        let status = Arc::clone(&self.status);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { status.remove_run(&request_id).await });
        }
    }
}

/// Owns a live instance and the admission permit that paid for it.
///
/// `release()` is the normal path. If the guard is dropped first (the run
/// future was abandoned), destruction is spawned so the instance is still
/// torn down, and the permit is only returned once that finishes.
struct InstanceGuard {
    factory: Arc<dyn SandboxFactory>,
    sandbox: Option<Box<dyn Sandbox>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl InstanceGuard {
    fn sandbox(&mut self) -> Option<&mut (dyn Sandbox + 'static)> {
        self.sandbox.as_deref_mut()
    }

    async fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            self.factory.destroy(sandbox).await;
        }
        self.permit.take();
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let factory = Arc::clone(&self.factory);
                handle.spawn(async move {
                    factory.destroy(sandbox).await;
                    drop(permit);
                });
            }
            // The backend's own Drop removes what it can synchronously.
            Err(_) => drop(sandbox),
        }
    }
}

/// Accepts run requests and drives each through provision → execute →
/// release.
pub struct Orchestrator {
    factory: Arc<dyn SandboxFactory>,
    policy: Arc<ExecutionPolicy>,
    registry: Arc<ImageRegistry>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    admission: Admission,
    status: Option<Arc<StatusTracker>>,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn SandboxFactory>,
        policy: Arc<ExecutionPolicy>,
        registry: Arc<ImageRegistry>,
        max_concurrent: usize,
        admission: Admission,
    ) -> Self {
        Self {
            factory,
            policy,
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            admission,
            status: None,
        }
    }

    /// Record active request ids in `status`.
    pub fn with_status(mut self, status: Arc<StatusTracker>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn policy(&self) -> &Arc<ExecutionPolicy> {
        &self.policy
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<dyn SandboxFactory> {
        &self.factory
    }

    pub async fn execute(&self, request: &RunRequest) -> RunResult {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Run one request to completion. Cancelling `cancel` kills the
    /// program the same way a timeout does.
    pub async fn execute_with_cancel(
        &self,
        request: &RunRequest,
        cancel: CancellationToken,
    ) -> RunResult {
        let request_id = request.request_id.as_str();

        let image = match self.registry.resolve(&request.language_id) {
            Ok(image) => image.clone(),
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "cannot resolve language");
                let mut result =
                    RunResult::rejected(request_id, RunStatus::InternalError, e.to_string());
                result.stage = Some(Stage::Resolve);
                return result;
            }
        };

        let permit = match self.admit(&cancel).await {
            Ok(permit) => permit,
            Err(Rejected::Cancelled) => {
                info!(request_id = %request_id, "request cancelled while queued");
                let mut result = RunResult::rejected(
                    request_id,
                    RunStatus::Timeout,
                    "cancelled while waiting for a run slot",
                );
                result.termination = Some(Termination::Cancelled);
                return result;
            }
            Err(Rejected::Busy(reason)) => {
                warn!(request_id = %request_id, reason = %reason, "request rejected");
                return RunResult::rejected(request_id, RunStatus::ResourceExhausted, reason);
            }
        };

        let active = match &self.status {
            Some(status) => Some(ActiveRun::enter(Arc::clone(status), request_id).await),
            None => None,
        };
        let result = self.run(request, image, permit, &cancel).await;
        if let Some(active) = active {
            active.leave().await;
        }

        info!(
            request_id = %request_id,
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "run finished"
        );
        result
    }

    async fn admit(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, Rejected> {
        let permits = Arc::clone(&self.permits);
        match self.admission {
            Admission::Reject => permits.try_acquire_owned().map_err(|_| {
                Rejected::Busy(format!(
                    "concurrency limit of {} runs reached",
                    self.max_concurrent
                ))
            }),
            Admission::Queue(wait) => {
                tokio::select! {
                    acquired = tokio::time::timeout(wait, permits.acquire_owned()) => match acquired {
                        Ok(Ok(permit)) => Ok(permit),
                        Ok(Err(_)) => Err(Rejected::Busy("orchestrator is shutting down".into())),
                        Err(_) => Err(Rejected::Busy(format!(
                            "no run slot became free within {} ms",
                            wait.as_millis()
                        ))),
                    },
                    () = cancel.cancelled() => Err(Rejected::Cancelled),
                }
            }
        }
    }

    async fn run(
        &self,
        request: &RunRequest,
        image: SandboxImage,
        permit: OwnedSemaphorePermit,
        cancel: &CancellationToken,
    ) -> RunResult {
        let request_id = request.request_id.as_str();
        let mut run = RunTracker::new(request_id);

        run.advance(RunState::Provisioning);
        let config = SandboxConfig {
            id: Uuid::new_v4(),
            request_id: request_id.to_string(),
            policy: Arc::clone(&self.policy),
            image: image.clone(),
        };
        let sandbox = match self.factory.create(config).await {
            Ok(sandbox) => sandbox,
            Err(SandboxError::PolicyViolation(reason)) => {
                error!(request_id = %request_id, reason = %reason, "provisioning refused");
                run.advance(RunState::Crashed);
                return RunResult::rejected(request_id, RunStatus::PolicyViolation, reason);
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "provisioning failed");
                run.advance(RunState::Crashed);
                return RunResult::rejected(request_id, RunStatus::InternalError, e.to_string());
            }
        };
        let mut guard = InstanceGuard {
            factory: Arc::clone(&self.factory),
            sandbox: Some(sandbox),
            permit: Some(permit),
        };

        run.advance(RunState::Running);
        let started = Instant::now();
        let deadline = started + self.policy.wall_clock_limit();
        let outcome = match guard.sandbox() {
            Some(sandbox) => execute_steps(sandbox, &image, request, deadline, cancel).await,
            None => Err(SandboxError::ExecFailed("instance missing".into())),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = classify(request_id, outcome, duration_ms);
        run.advance(match result.status {
            RunStatus::Timeout => RunState::TimedOut,
            RunStatus::InternalError => RunState::Crashed,
            _ => RunState::Completed,
        });

        guard.release().await;
        run.advance(RunState::Released);
        result
    }
}

struct StepOutput {
    stage: Stage,
    exit: ProcessExit,
}

/// Write the submission into the workspace, compile if the image needs
/// it, then run the entrypoint. One deadline covers both steps.
async fn execute_steps(
    sandbox: &mut dyn Sandbox,
    image: &SandboxImage,
    request: &RunRequest,
    deadline: Instant,
    cancel: &CancellationToken,
) -> sandbox::Result<StepOutput> {
    let workdir = sandbox.workdir().to_path_buf();
    let vars = TemplateVars {
        source: workdir.join(&image.source_file).display().to_string(),
        workdir: workdir.display().to_string(),
        stdin: workdir.join(STDIN_FILE).display().to_string(),
    };
    sandbox
        .write_file(&image.source_file, request.source_code.as_bytes())
        .await?;
    sandbox
        .write_file(STDIN_FILE, request.stdin.as_bytes())
        .await?;

    if let Some(compile) = &image.compile_template {
        let exit = launch(sandbox, &compile.render(&vars), b"", deadline, cancel).await?;
        if !exit.outcome.is_success() {
            return Ok(StepOutput {
                stage: Stage::Compile,
                exit,
            });
        }
    }

    let argv = image.entrypoint_template.render(&vars);
    let exit = launch(sandbox, &argv, request.stdin.as_bytes(), deadline, cancel).await?;
    Ok(StepOutput {
        stage: Stage::Run,
        exit,
    })
}

async fn launch(
    sandbox: &mut dyn Sandbox,
    argv: &[String],
    stdin: &[u8],
    deadline: Instant,
    cancel: &CancellationToken,
) -> sandbox::Result<ProcessExit> {
    sandbox
        .run(&ExecRequest {
            argv,
            stdin,
            timeout: deadline.saturating_duration_since(Instant::now()),
            cancel,
        })
        .await
}

/// Map an execution outcome onto the result taxonomy.
fn classify(
    request_id: &str,
    outcome: sandbox::Result<StepOutput>,
    duration_ms: u64,
) -> RunResult {
    let step = match outcome {
        Ok(step) => step,
        Err(SandboxError::PolicyViolation(reason)) => {
            warn!(request_id = %request_id, reason = %reason, "program blocked");
            let mut result = RunResult::rejected(request_id, RunStatus::PolicyViolation, reason);
            result.duration_ms = duration_ms;
            return result;
        }
        Err(e) => {
            error!(request_id = %request_id, error = %e, "execution failed");
            let mut result = RunResult::rejected(request_id, RunStatus::InternalError, e.to_string());
            result.duration_ms = duration_ms;
            return result;
        }
    };

    let (status, termination) = match step.exit.outcome {
        ExitOutcome::Exited(0) => (RunStatus::Success, None),
        ExitOutcome::TimedOut => (RunStatus::Timeout, Some(Termination::WallClock)),
        ExitOutcome::Cancelled => (RunStatus::Timeout, Some(Termination::Cancelled)),
        ExitOutcome::Signaled(signal) if signal == Signal::SIGXCPU as i32 => {
            (RunStatus::Timeout, Some(Termination::CpuTime))
        }
        ExitOutcome::Exited(_) | ExitOutcome::Signaled(_) => (RunStatus::RuntimeError, None),
    };

    RunResult {
        request_id: request_id.to_string(),
        status,
        stdout: String::from_utf8_lossy(&step.exit.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&step.exit.stderr).into_owned(),
        exit_code: step.exit.outcome.exit_code(),
        duration_ms,
        stage: Some(step.stage),
        termination,
        stdout_truncated: step.exit.stdout_truncated,
        stderr_truncated: step.exit.stderr_truncated,
        message: None,
    }
}
