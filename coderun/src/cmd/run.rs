use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Args;
use coderun::config;
use coderun::error::{CoderunError, CoderunResult};
use coderun::lock;
use coderun::paths::CoderunPaths;
use coderun::report::report;
use coderun::runtime::Runtime;
use coderun::types::{RunRequest, RunStatus};

#[derive(Args)]
pub struct RunArgs {
    /// Path to coderun.yaml config file
    #[arg(long, short, env = "CODERUN_CONFIG")]
    config: PathBuf,
    /// Language id or alias (e.g. cpp, python)
    #[arg(long, short)]
    language: String,
    /// Source file to execute
    #[arg(long, short)]
    source: PathBuf,
    /// File whose contents are piped to the program's stdin
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// Correlation id echoed in the response
    #[arg(long)]
    request_id: Option<String>,
}

/// Execute one program and print its response as JSON.
///
/// Exits non-zero unless the program succeeded.
pub async fn run_run(args: RunArgs) -> CoderunResult<ExitCode> {
    let config = config::load(&args.config).await?;
    let source_code = read_text(&args.source).await?;
    let stdin = match &args.stdin {
        Some(path) => read_text(path).await?,
        None => String::new(),
    };

    tokio::fs::create_dir_all(&config.base_dir)
        .await
        .map_err(|e| {
            CoderunError::Config(format!("create base_dir {}: {e}", config.base_dir.display()))
        })?;
    let paths = CoderunPaths::new(config.base_dir.clone());
    let _lock = lock::try_acquire(paths.lock()).await?;

    let runtime = Runtime::build(&config, None).await?;
    let request = RunRequest {
        language_id: args.language,
        source_code,
        stdin,
        request_id: args
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    };
    let result = runtime.orchestrator.execute(&request).await;
    runtime.shutdown().await;

    let response = report(&result, &runtime.redactor);
    let json = serde_json::to_string_pretty(&response)
        .map_err(|e| CoderunError::Internal(format!("serialize response: {e}")))?;
    println!("{json}");

    Ok(if result.status == RunStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn read_text(path: &Path) -> CoderunResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CoderunError::Config(format!("read {}: {e}", path.display())))
}
