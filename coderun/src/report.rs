use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{RunResult, RunStatus, Stage, Termination};

/// Shown instead of any detail when the service itself failed.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error while executing the program";

/// Finer-grained outcome for callers. Splits compile-stage runtime errors
/// out of `runtime_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Success,
    CompilationError,
    RuntimeError,
    Timeout,
    PolicyViolation,
    InternalError,
    /// The language is not registered. Reported as `internal_error`
    /// status, but the caller sent it, so the reason stays visible.
    UnsupportedLanguage,
    ResourceExhausted,
}

/// Caller-facing form of a [`RunResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub request_id: String,
    pub status: RunStatus,
    pub category: Category,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Rewrites host paths in program output so responses never reveal the
/// service's filesystem layout.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    instance_roots: Vec<String>,
    base_dir: Option<String>,
    workdir: String,
}

impl Redactor {
    /// `instance_roots` are parent dirs of per-run instance dirs;
    /// `<root>/<id>/workspace` becomes `workdir`, any other path under
    /// `base_dir` or an instance root becomes `<sandbox>`.
    pub fn new(base_dir: &Path, instance_roots: &[&Path], workdir: &Path) -> Self {
        let mut roots: Vec<String> = instance_roots
            .iter()
            .map(|p| p.display().to_string())
            .filter(|p| !p.is_empty() && p != "/")
            .collect();
        // Longest first so nested roots win.
        roots.sort_by_key(|r| std::cmp::Reverse(r.len()));
        let base_dir = base_dir.display().to_string();
        Self {
            instance_roots: roots,
            base_dir: (!base_dir.is_empty() && base_dir != "/").then_some(base_dir),
            workdir: workdir.display().to_string(),
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for root in &self.instance_roots {
            out = redact_instances(&out, root, &self.workdir);
        }
        if let Some(base) = &self.base_dir {
            out = out.replace(base.as_str(), "<sandbox>");
        }
        out
    }
}

fn redact_instances(text: &str, root: &str, workdir: &str) -> String {
    let prefix = format!("{root}/");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(&prefix) {
        out.push_str(rest.get(..pos).unwrap_or_default());
        let after = rest.get(pos + prefix.len()..).unwrap_or_default();
        let id_len = after
            .find(|c: char| !(c.is_ascii_hexdigit() || c == '-'))
            .unwrap_or(after.len());
        let tail = after.get(id_len..).unwrap_or_default();
        match tail.strip_prefix("/workspace") {
            Some(remaining) if id_len > 0 => {
                out.push_str(workdir);
                rest = remaining;
            }
            _ => {
                out.push_str("<sandbox>");
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Package a result for the caller.
pub fn report(result: &RunResult, redactor: &Redactor) -> RunResponse {
    let category = match (result.status, result.stage) {
        (RunStatus::Success, _) => Category::Success,
        (RunStatus::RuntimeError, Some(Stage::Compile)) => Category::CompilationError,
        (RunStatus::RuntimeError, _) => Category::RuntimeError,
        (RunStatus::Timeout, _) => Category::Timeout,
        (RunStatus::PolicyViolation, _) => Category::PolicyViolation,
        (RunStatus::InternalError, Some(Stage::Resolve)) => Category::UnsupportedLanguage,
        (RunStatus::InternalError, _) => Category::InternalError,
        (RunStatus::ResourceExhausted, _) => Category::ResourceExhausted,
    };

    let (stdout, stderr, message) = if category == Category::InternalError {
        (
            String::new(),
            String::new(),
            Some(INTERNAL_ERROR_MESSAGE.to_string()),
        )
    } else {
        (
            redactor.redact(&result.stdout),
            redactor.redact(&result.stderr),
            result.message.as_deref().map(|m| redactor.redact(m)),
        )
    };

    RunResponse {
        request_id: result.request_id.clone(),
        status: result.status,
        category,
        stdout,
        stderr,
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
        stage: result.stage,
        termination: result.termination,
        stdout_truncated: result.stdout_truncated,
        stderr_truncated: result.stderr_truncated,
        message,
    }
}
