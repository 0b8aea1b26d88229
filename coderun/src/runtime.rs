use std::sync::Arc;

use sandbox::SandboxFactory;
use sandbox_process::ProcessFactory;
use tracing::info;

use crate::config::CoderunConfig;
use crate::error::CoderunResult;
use crate::executor::Orchestrator;
use crate::report::Redactor;
use crate::status::StatusTracker;

/// Everything built from one config: the frozen policy and registry, a
/// started provisioner, and the orchestrator over them.
pub struct Runtime {
    pub orchestrator: Arc<Orchestrator>,
    pub redactor: Arc<Redactor>,
}

impl Runtime {
    /// Validate `config` and start a provisioner for it.
    pub async fn build(
        config: &CoderunConfig,
        status: Option<Arc<StatusTracker>>,
    ) -> CoderunResult<Self> {
        let policy = Arc::new(config.execution_policy()?);
        let registry = Arc::new(config.image_registry(&policy)?);

        let mut factory = ProcessFactory::new(config.process_config()).await?;
        factory.startup().await?;
        let redactor = Redactor::new(
            &config.base_dir,
            &[factory.instances_root(&policy).as_path()],
            policy.workdir(),
        );
        let factory: Arc<dyn SandboxFactory> = Arc::new(factory);

        let mut orchestrator = Orchestrator::new(
            factory,
            Arc::clone(&policy),
            Arc::clone(&registry),
            config.limits.max_concurrent,
            config.admission(),
        );
        if let Some(status) = status {
            status.set_policy(policy.fingerprint()).await;
            orchestrator = orchestrator.with_status(status);
        }
        info!(
            languages = %registry.languages().collect::<Vec<_>>().join(","),
            policy = %policy.fingerprint(),
            max_concurrent = config.limits.max_concurrent,
            "runtime ready"
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            redactor: Arc::new(redactor),
        })
    }

    /// Tear down every instance the provisioner still tracks.
    pub async fn shutdown(&self) {
        self.orchestrator.factory().shutdown().await;
    }
}
