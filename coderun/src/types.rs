use std::fmt;

use serde::{Deserialize, Serialize};

/// One submission: untrusted source plus its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub language_id: String,
    pub source_code: String,
    #[serde(default)]
    pub stdin: String,
    /// Correlation id echoed in the result. Generated when absent.
    #[serde(default = "new_request_id")]
    pub request_id: String,
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    RuntimeError,
    Timeout,
    PolicyViolation,
    InternalError,
    /// Rejected at admission: the concurrency cap was reached.
    ResourceExhausted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::RuntimeError => "runtime_error",
            Self::Timeout => "timeout",
            Self::PolicyViolation => "policy_violation",
            Self::InternalError => "internal_error",
            Self::ResourceExhausted => "resource_exhausted",
        };
        f.write_str(s)
    }
}

/// Which step produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Language lookup; nothing was provisioned.
    Resolve,
    Compile,
    Run,
}

/// Why a run ended in [`RunStatus::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    WallClock,
    CpuTime,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub request_id: String,
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Time spent executing the program (and its compile step), excluding
    /// admission and provisioning.
    pub duration_ms: u64,
    pub stage: Option<Stage>,
    pub termination: Option<Termination>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Why the run never produced program output. Internal detail for
    /// `InternalError`, never shown to callers.
    pub message: Option<String>,
}

impl RunResult {
    /// A result for a run that ended before any program started.
    pub fn rejected(request_id: &str, status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            status,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
            stage: None,
            termination: None,
            stdout_truncated: false,
            stderr_truncated: false,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case() {
        let request: RunRequest = serde_json::from_str(
            r#"{"languageId":"cpp","sourceCode":"int main(){}","stdin":"1 2","requestId":"r-1"}"#,
        )
        .unwrap();
        assert_eq!(request.language_id, "cpp");
        assert_eq!(request.request_id, "r-1");
    }

    #[test]
    fn request_defaults() {
        let request: RunRequest =
            serde_json::from_str(r#"{"languageId":"python","sourceCode":"print(1)"}"#).unwrap();
        assert!(request.stdin.is_empty());
        assert!(uuid::Uuid::parse_str(&request.request_id).is_ok());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::ResourceExhausted).unwrap(),
            "\"resource_exhausted\""
        );
        assert_eq!(RunStatus::PolicyViolation.to_string(), "policy_violation");
        assert_eq!(
            serde_json::to_string(&Termination::WallClock).unwrap(),
            "\"wall_clock\""
        );
    }
}
