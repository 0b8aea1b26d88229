use std::sync::Arc;

use crate::image::SandboxImage;
use crate::policy::ExecutionPolicy;

/// Everything a factory needs to provision one instance.
pub struct SandboxConfig {
    pub id: uuid::Uuid,
    /// Caller-supplied correlation id, carried into logs.
    pub request_id: String,
    /// Snapshot of the policy active when the instance was requested.
    pub policy: Arc<ExecutionPolicy>,
    pub image: SandboxImage,
}
