use std::path::PathBuf;

use clap::Args;
use coderun::config;
use coderun::error::CoderunResult;
use sandbox::ProgramRef;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to coderun.yaml config file
    #[arg(long, short, env = "CODERUN_CONFIG")]
    config: PathBuf,
}

/// Validate policy and images, then exercise the isolation backend.
pub async fn run_check(args: CheckArgs) -> CoderunResult<()> {
    let config = config::load(&args.config).await?;
    let policy = config.execution_policy()?;
    let registry = config.image_registry(&policy)?;
    sandbox_process::check_prerequisites(&config.process_config()).await?;

    println!("policy {}", policy.fingerprint());
    for language in registry.languages() {
        let image = registry.resolve(language)?;
        let programs = image
            .compile_template
            .iter()
            .chain(std::iter::once(&image.entrypoint_template));
        let mut missing = Vec::new();
        for template in programs {
            if let ProgramRef::Binary(name) = template.program()
                && image.uses_host_root()
                && which::which(name).is_err()
            {
                missing.push(name.to_string());
            }
        }
        if missing.is_empty() {
            println!("{language}: ok");
        } else {
            println!("{language}: missing {}", missing.join(", "));
        }
    }
    Ok(())
}
