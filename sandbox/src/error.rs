#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    /// An isolation guarantee could not be upheld, or the program was
    /// blocked before it started.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
