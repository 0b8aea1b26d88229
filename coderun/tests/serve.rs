use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use coderun::executor::{Admission, Orchestrator};
use coderun::report::{Category, Redactor, RunResponse};
use coderun::server::{Control, ServeExit, serve_requests, spawn_writer};
use coderun::types::RunStatus;
use sandbox::{
    CommandTemplate, PolicyConfig, RegistryBuilder, SandboxFactory, SandboxImage, load_policy,
};
use sandbox_process::{LauncherKind, ProcessConfig, ProcessFactory};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

struct Service {
    orchestrator: Arc<Orchestrator>,
    redactor: Arc<Redactor>,
    _base: tempfile::TempDir,
}

async fn service() -> Service {
    let base = tempfile::tempdir().unwrap();
    std::fs::set_permissions(base.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    let policy = Arc::new(
        load_policy(&PolicyConfig {
            allowed_binaries: vec!["sh".into(), "cat".into(), "sleep".into()],
            wall_clock_limit_ms: 5_000,
            ..PolicyConfig::default()
        })
        .unwrap(),
    );
    let mut builder = RegistryBuilder::new();
    builder
        .register(SandboxImage {
            language_id: "sh".into(),
            aliases: vec![],
            image_reference: "host".into(),
            source_file: "main.sh".into(),
            compile_template: None,
            entrypoint_template: CommandTemplate::parse("sh {source}").unwrap(),
        })
        .unwrap();

    let mut factory = ProcessFactory::new(ProcessConfig::new(
        base.path().to_path_buf(),
        LauncherKind::Host,
    ))
    .await
    .unwrap();
    factory.startup().await.unwrap();
    let instances = factory.instances_root(&policy);
    let redactor = Redactor::new(base.path(), &[instances.as_path()], policy.workdir());
    let factory: Arc<dyn SandboxFactory> = Arc::new(factory);

    Service {
        orchestrator: Arc::new(Orchestrator::new(
            factory,
            policy,
            Arc::new(builder.freeze()),
            4,
            Admission::Reject,
        )),
        redactor: Arc::new(redactor),
        _base: base,
    }
}

fn line(request_id: &str, source: &str) -> String {
    serde_json::json!({
        "languageId": "sh",
        "sourceCode": source,
        "requestId": request_id,
    })
    .to_string()
}

#[tokio::test]
async fn serves_each_line_until_eof() {
    let svc = service().await;
    let input = format!(
        "{}\n\nnot json\n{}\n",
        line("first", "echo one"),
        line("second", "exit 2")
    );
    let mut lines = BufReader::new(input.as_bytes()).lines();
    let (out, mut read_half) = tokio::io::duplex(64 * 1024);
    let (responses, writer) = spawn_writer(out);
    let (_control_tx, mut control) = tokio::sync::watch::channel(Control::Running);

    let exit = serve_requests(
        &mut lines,
        &responses,
        &svc.orchestrator,
        &svc.redactor,
        &mut control,
    )
    .await
    .unwrap();
    assert_eq!(exit, ServeExit::Eof);
    drop(responses);
    writer.await.unwrap().unwrap();

    let mut output = String::new();
    read_half.read_to_string(&mut output).await.unwrap();
    let replies: Vec<serde_json::Value> = output
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(replies.len(), 3, "{output}");

    let errors = replies.iter().filter(|r| r.get("error").is_some()).count();
    assert_eq!(errors, 1);

    let runs: Vec<RunResponse> = replies
        .into_iter()
        .filter(|r| r.get("error").is_none())
        .map(|r| serde_json::from_value(r).unwrap())
        .collect();
    let first = runs.iter().find(|r| r.request_id == "first").unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.stdout, "one\n");
    let second = runs.iter().find(|r| r.request_id == "second").unwrap();
    assert_eq!(second.category, Category::RuntimeError);
    assert_eq!(second.exit_code, Some(2));
}

#[tokio::test]
async fn stop_cancels_in_flight_runs() {
    let svc = service().await;
    // Keep the input open so only the stop ends serving.
    let (mut input_tx, input_rx) = tokio::io::duplex(4096);
    let mut lines = BufReader::new(input_rx).lines();
    let (out, mut read_half) = tokio::io::duplex(64 * 1024);
    let (responses, writer) = spawn_writer(out);
    let (control_tx, mut control) = tokio::sync::watch::channel(Control::Running);

    input_tx
        .write_all(format!("{}\n", line("slow", "sleep 30")).as_bytes())
        .await
        .unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        control_tx.send(Control::Stop).unwrap();
        // Hold the sender until serving has returned.
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let exit = tokio::time::timeout(
        Duration::from_secs(4),
        serve_requests(
            &mut lines,
            &responses,
            &svc.orchestrator,
            &svc.redactor,
            &mut control,
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(exit, ServeExit::Stop);
    drop(responses);
    writer.await.unwrap().unwrap();

    let mut output = String::new();
    read_half.read_to_string(&mut output).await.unwrap();
    let reply: RunResponse = serde_json::from_str(output.trim()).unwrap();
    assert_eq!(reply.request_id, "slow");
    assert_eq!(reply.status, RunStatus::Timeout);
    assert_eq!(svc.orchestrator.factory().live_count(), 0);
}
