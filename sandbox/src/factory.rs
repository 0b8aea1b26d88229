use async_trait::async_trait;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

/// The isolation provisioner: turns an image + policy into live instances.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "bubblewrap").
    fn name(&self) -> &str;
    /// Initialize factory resources and reclaim anything a previous process
    /// left behind. Must be called before `create()` or `destroy()`.
    async fn startup(&mut self) -> Result<()>;
    /// Provision a new instance. Instances are never pooled or reused.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;
    /// Tear down an instance. Never fails; problems are logged.
    async fn destroy(&self, sandbox: Box<dyn Sandbox>);
    /// Number of instances currently provisioned and not yet released.
    fn live_count(&self) -> usize;
    /// True once an isolation breach has halted provisioning.
    fn is_halted(&self) -> bool;
    /// Re-enable provisioning after an operator has corrected the breach.
    fn reset_breaker(&self);
    /// Release all factory-level resources, including any instance that
    /// was never destroyed.
    async fn shutdown(&self);
}
