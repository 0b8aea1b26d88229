#[derive(Debug, thiserror::Error)]
pub enum CoderunError {
    #[error("config error: {0}")]
    Config(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoderunResult<T> = Result<T, CoderunError>;
