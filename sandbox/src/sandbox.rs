use std::any::Any;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::Result;
use crate::policy::ExecutionPolicy;
use crate::types::{ExecRequest, ProcessExit};

/// One ephemeral isolated execution context, bound to a single run request.
///
/// The `Any` bound allows `SandboxFactory::destroy()` to downcast
/// `Box<dyn Sandbox>` back to the concrete type for backend-specific cleanup.
#[async_trait]
pub trait Sandbox: Send + Sync + Any {
    // -- identity --
    fn id(&self) -> &str;
    fn request_id(&self) -> &str;
    fn created_at(&self) -> SystemTime;
    fn policy(&self) -> &ExecutionPolicy;
    /// Host path of the writable workspace.
    fn workspace(&self) -> &Path;
    /// The workspace as seen by the sandboxed program.
    fn workdir(&self) -> &Path;

    // -- operations --
    /// Write a file into the workspace. `name` must be a plain file name.
    async fn write_file(&self, name: &str, content: &[u8]) -> Result<()>;
    async fn run(&mut self, request: &ExecRequest<'_>) -> Result<ProcessExit>;

    // -- lifecycle --
    /// Terminate every process still running under this instance.
    async fn kill(&mut self);
    /// Kill lingering processes, remove the filesystem root, release the
    /// identity. Idempotent: a second call does nothing.
    async fn release(&mut self) -> Result<()>;
    fn is_released(&self) -> bool;
}
