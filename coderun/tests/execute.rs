use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use coderun::executor::{Admission, Orchestrator};
use coderun::presets;
use coderun::report::{Category, Redactor, report};
use coderun::status::StatusTracker;
use coderun::types::{RunRequest, RunStatus, Stage, Termination};
use sandbox::{
    CommandTemplate, ExecutionPolicy, MountSpec, PolicyConfig, RegistryBuilder,
    SandboxFactory, SandboxImage, load_policy,
};
use sandbox_process::{LauncherKind, ProcessConfig, ProcessFactory};
use tokio_util::sync::CancellationToken;

struct Harness {
    orchestrator: Orchestrator,
    instances: PathBuf,
    /// The factory kills processes that leave their group.
    contains_processes: bool,
    /// Unlisted executables are hidden from programs.
    masks_executables: bool,
    _base: tempfile::TempDir,
}

impl Harness {
    fn leftover_instances(&self) -> usize {
        std::fs::read_dir(&self.instances).unwrap().count()
    }
}

fn sh_image() -> SandboxImage {
    SandboxImage {
        language_id: "sh".into(),
        aliases: vec!["shell".into()],
        image_reference: "host".into(),
        source_file: "main.sh".into(),
        compile_template: None,
        entrypoint_template: CommandTemplate::parse("sh {source}").unwrap(),
    }
}

async fn harness(
    customize: impl FnOnce(&mut PolicyConfig),
    max_concurrent: usize,
    admission: Admission,
) -> Harness {
    let base = tempfile::tempdir().unwrap();
    // The dropped identity must be able to traverse the base dir when
    // tests run as root.
    std::fs::set_permissions(base.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = PolicyConfig {
        allowed_binaries: ["sh", "cat", "sleep", "echo", "g++", "as", "ld"]
            .iter()
            .map(|b| b.to_string())
            .collect(),
        wall_clock_limit_ms: 2_000,
        ..PolicyConfig::default()
    };
    customize(&mut config);
    let policy: Arc<ExecutionPolicy> = Arc::new(load_policy(&config).unwrap());

    let mut builder = RegistryBuilder::new();
    builder.register(sh_image()).unwrap();
    for image in presets::images().unwrap() {
        if image.language_id == "cpp" {
            builder.register(image).unwrap();
        }
    }
    let registry = Arc::new(builder.freeze());

    let mut factory = ProcessFactory::new(ProcessConfig::new(
        base.path().to_path_buf(),
        LauncherKind::Host,
    ))
    .await
    .unwrap();
    factory.startup().await.unwrap();
    let instances = factory.instances_root(&policy);
    let contains_processes = factory.contains_processes();
    let masks_executables = factory.masks_executables();
    let factory: Arc<dyn SandboxFactory> = Arc::new(factory);

    Harness {
        orchestrator: Orchestrator::new(factory, policy, registry, max_concurrent, admission),
        instances,
        contains_processes,
        masks_executables,
        _base: base,
    }
}

fn request(language: &str, source: &str, stdin: &str) -> RunRequest {
    RunRequest {
        language_id: language.into(),
        source_code: source.into(),
        stdin: stdin.into(),
        request_id: uuid::Uuid::new_v4().to_string(),
    }
}

fn have(binary: &str) -> bool {
    which::which(binary).is_ok()
}

#[tokio::test]
async fn successful_run_echoes_stdin() {
    let h = harness(|_| {}, 2, Admission::Reject).await;
    let req = request("sh", "cat\necho done >&2\n", "hello\n");
    let result = h.orchestrator.execute(&req).await;

    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.request_id, req.request_id);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "done\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stage, Some(Stage::Run));
    assert_eq!(h.leftover_instances(), 0);
    assert_eq!(h.orchestrator.factory().live_count(), 0);
}

#[tokio::test]
async fn alias_resolves_case_insensitively() {
    let h = harness(|_| {}, 1, Admission::Reject).await;
    let result = h.orchestrator.execute(&request("SHELL", "echo hi", "")).await;
    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.stdout, "hi\n");
}

#[tokio::test]
async fn nonzero_exit_is_runtime_error() {
    let h = harness(|_| {}, 1, Admission::Reject).await;
    let result = h
        .orchestrator
        .execute(&request("sh", "echo partial\nexit 3\n", ""))
        .await;
    assert_eq!(result.status, RunStatus::RuntimeError);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stdout, "partial\n");
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn wall_clock_timeout_keeps_partial_output() {
    let h = harness(|p| p.wall_clock_limit_ms = 500, 1, Admission::Reject).await;
    let started = Instant::now();
    let result = h
        .orchestrator
        .execute(&request("sh", "echo before\nsleep 30\necho after\n", ""))
        .await;

    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(result.termination, Some(Termination::WallClock));
    assert_eq!(result.exit_code, None);
    assert_eq!(result.stdout, "before\n");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn unsupported_language_never_provisions() {
    let h = harness(|_| {}, 1, Admission::Reject).await;
    let result = h.orchestrator.execute(&request("cobol", "DISPLAY 'X'.", "")).await;
    assert_eq!(result.status, RunStatus::InternalError);
    assert_eq!(result.stage, Some(Stage::Resolve));
    assert!(result.message.as_deref().unwrap().contains("cobol"));
    assert_eq!(h.leftover_instances(), 0);

    // The caller sees why, unlike a genuine internal failure.
    let response = report(&result, &Redactor::default());
    assert_eq!(response.category, Category::UnsupportedLanguage);
    assert!(response.message.unwrap().contains("unsupported language: cobol"));
}

#[tokio::test]
async fn unsupported_language_is_resolved_before_admission() {
    let h = harness(|_| {}, 1, Admission::Reject).await;
    let busy = request("sh", "sleep 1", "");
    let unsupported = request("cobol", "DISPLAY 'X'.", "");
    let (first, second) = tokio::join!(h.orchestrator.execute(&busy), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.orchestrator.execute(&unsupported).await
    });
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(second.status, RunStatus::InternalError, "{second:?}");
    assert_eq!(second.stage, Some(Stage::Resolve));
}

#[tokio::test]
async fn tool_off_path_is_runtime_error() {
    let h = harness(|_| {}, 1, Admission::Reject).await;
    // The workspace PATH only contains allowed binaries.
    let result = h.orchestrator.execute(&request("sh", "curl http://example.com", "")).await;
    assert_eq!(result.status, RunStatus::RuntimeError);
    assert_eq!(result.exit_code, Some(127));
    assert!(result.stderr.contains("curl"), "{}", result.stderr);
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn absolute_path_to_unlisted_tool_fails() {
    let h = harness(|_| {}, 1, Admission::Reject).await;
    let Ok(id) = which::which("id") else {
        return;
    };
    if !h.masks_executables {
        eprintln!("host launcher cannot mask executables here, skipping");
        return;
    }
    let result = h
        .orchestrator
        .execute(&request("sh", &format!("{} -un", id.display()), ""))
        .await;
    assert_eq!(result.status, RunStatus::RuntimeError, "{result:?}");
    assert!(result.stdout.is_empty(), "{result:?}");
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn background_session_is_killed_with_the_run() {
    let h = harness(|p| p.allowed_binaries.push("setsid".into()), 1, Admission::Reject).await;
    if !h.contains_processes || !have("setsid") {
        eprintln!("no cgroup containment or setsid here, skipping");
        return;
    }
    let result = h
        .orchestrator
        .execute(&request("sh", "setsid sleep 7715 &\necho launched\n", ""))
        .await;
    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.stdout, "launched\n");

    let survivors = std::fs::read_dir("/proc")
        .unwrap()
        .flatten()
        .filter(|entry| {
            std::fs::read(entry.path().join("cmdline"))
                .is_ok_and(|cmdline| cmdline.as_slice() == b"sleep\07715\0")
        })
        .count();
    assert_eq!(survivors, 0);
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn exposed_host_tree_halts_provisioning() {
    let h = harness(
        |p| {
            p.filesystem_mounts = vec![MountSpec {
                host_path: "/".into(),
                container_path: "/host".into(),
                read_only: true,
            }];
        },
        1,
        Admission::Reject,
    )
    .await;
    let result = h.orchestrator.execute(&request("sh", "echo hi", "")).await;
    assert_eq!(result.status, RunStatus::PolicyViolation, "{result:?}");
    assert!(h.orchestrator.factory().is_halted());
    assert_eq!(h.leftover_instances(), 0);

    // Stays refused until the breaker is reset.
    let again = h.orchestrator.execute(&request("sh", "echo hi", "")).await;
    assert_eq!(again.status, RunStatus::PolicyViolation);
}

#[tokio::test]
async fn output_is_truncated_at_limit() {
    let h = harness(|p| p.max_output_bytes = 8, 1, Admission::Reject).await;
    let result = h
        .orchestrator
        .execute(&request("sh", "echo 0123456789abcdef", ""))
        .await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.stdout, "01234567");
    assert!(result.stdout_truncated);
    assert!(!result.stderr_truncated);
}

#[tokio::test]
async fn over_capacity_is_rejected() {
    let h = harness(|_| {}, 2, Admission::Reject).await;
    let slow = request("sh", "sleep 1", "");
    let (a, b, c, peak) = tokio::join!(
        h.orchestrator.execute(&slow),
        h.orchestrator.execute(&slow),
        h.orchestrator.execute(&slow),
        async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            h.orchestrator.factory().live_count()
        }
    );

    let statuses = [a.status, b.status, c.status];
    let exhausted = statuses
        .iter()
        .filter(|s| **s == RunStatus::ResourceExhausted)
        .count();
    assert_eq!(exhausted, 1, "{statuses:?}");
    assert_eq!(
        statuses.iter().filter(|s| **s == RunStatus::Success).count(),
        2
    );
    assert!(peak <= 2, "peak live instances {peak}");
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn queued_request_waits_for_slot() {
    let h = harness(|_| {}, 1, Admission::Queue(Duration::from_secs(5))).await;
    let first = request("sh", "sleep 0.3", "");
    let second = request("sh", "echo second", "");
    let (a, b) = tokio::join!(
        h.orchestrator.execute(&first),
        h.orchestrator.execute(&second),
    );
    assert_eq!(a.status, RunStatus::Success);
    assert_eq!(b.status, RunStatus::Success);
    assert_eq!(b.stdout, "second\n");
}

#[tokio::test]
async fn cancelled_while_queued_never_provisions() {
    let h = harness(|_| {}, 1, Admission::Queue(Duration::from_secs(10))).await;
    let busy = request("sh", "sleep 1.5", "");
    let queued = request("sh", "echo never", "");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    let (first, (second, waited, live)) = tokio::join!(h.orchestrator.execute(&busy), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let result = h.orchestrator.execute_with_cancel(&queued, cancel).await;
        (result, started.elapsed(), h.orchestrator.factory().live_count())
    });

    assert_eq!(second.status, RunStatus::Timeout, "{second:?}");
    assert_eq!(second.termination, Some(Termination::Cancelled));
    assert!(second.stdout.is_empty());
    assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    // Only the busy run's instance existed when the queued one gave up.
    assert_eq!(live, 1);
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn abandoned_run_leaves_status_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status.json");
    let status = Arc::new(StatusTracker::new(path.clone()));
    let mut h = harness(|p| p.wall_clock_limit_ms = 10_000, 1, Admission::Reject).await;
    h.orchestrator = h.orchestrator.with_status(Arc::clone(&status));

    let req = request("sh", "sleep 30", "");
    let abandoned =
        tokio::time::timeout(Duration::from_millis(500), h.orchestrator.execute(&req)).await;
    assert!(abandoned.is_err());

    let read_ids = || {
        let status: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        status["active_request_ids"].clone()
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    while read_ids() != serde_json::json!([]) {
        assert!(Instant::now() < deadline, "still active: {}", read_ids());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    let h = harness(|p| p.wall_clock_limit_ms = 10_000, 1, Admission::Reject).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = h
        .orchestrator
        .execute_with_cancel(&request("sh", "sleep 30", ""), cancel)
        .await;
    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(result.termination, Some(Termination::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn workspace_is_fresh_per_run() {
    let h = harness(|_| {}, 1, Admission::Reject).await;
    let first = h
        .orchestrator
        .execute(&request("sh", "echo secret > leftover.txt", ""))
        .await;
    assert_eq!(first.status, RunStatus::Success);

    let second = h
        .orchestrator
        .execute(&request("sh", "cat leftover.txt", ""))
        .await;
    assert_eq!(second.status, RunStatus::RuntimeError);
    assert!(second.stdout.is_empty());
}

const CALCULATOR: &str = include_str!("data/advanced_calculator.cpp");

const SPIN: &str = r#"
int main() {
    volatile long x = 0;
    for (;;) {
        x = x + 1;
    }
}
"#;

fn skip_without_gxx() -> bool {
    if have("g++") {
        return false;
    }
    eprintln!("g++ not found, skipping");
    true
}

#[tokio::test]
async fn cpp_calculator_adds() {
    if skip_without_gxx() {
        return;
    }
    let h = harness(|p| p.wall_clock_limit_ms = 30_000, 1, Admission::Reject).await;
    let result = h
        .orchestrator
        .execute(&request("cpp", CALCULATOR, "add\n3\n4\n"))
        .await;
    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.stdout, "7\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stage, Some(Stage::Run));
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn cpp_calculator_reports_division_by_zero() {
    if skip_without_gxx() {
        return;
    }
    let h = harness(|p| p.wall_clock_limit_ms = 30_000, 1, Admission::Reject).await;
    let result = h
        .orchestrator
        .execute(&request("c++", CALCULATOR, "divide\n5\n0\n"))
        .await;
    assert_eq!(result.status, RunStatus::Success, "{result:?}");
    assert_eq!(result.stdout, "Error: Division by zero\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn cpp_infinite_loop_times_out() {
    if skip_without_gxx() {
        return;
    }
    let h = harness(
        |p| {
            p.wall_clock_limit_ms = 30_000;
            p.cpu_time_limit_ms = 2_000;
        },
        1,
        Admission::Reject,
    )
    .await;
    let result = h.orchestrator.execute(&request("cpp", SPIN, "")).await;
    assert_eq!(result.status, RunStatus::Timeout, "{result:?}");
    assert_eq!(result.stage, Some(Stage::Run));
    assert_eq!(h.leftover_instances(), 0);
}

#[tokio::test]
async fn cpp_compile_error_stops_before_run() {
    if skip_without_gxx() {
        return;
    }
    let h = harness(|p| p.wall_clock_limit_ms = 30_000, 1, Admission::Reject).await;
    let result = h
        .orchestrator
        .execute(&request("cpp", "int main() { return missing; }", ""))
        .await;
    assert_eq!(result.status, RunStatus::RuntimeError);
    assert_eq!(result.stage, Some(Stage::Compile));
    assert!(result.stderr.contains("missing"), "{}", result.stderr);
}
