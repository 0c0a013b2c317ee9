use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration, Instant};
use warden::{Config, Supervisor, SupervisorError, Target};

const PATH_ENV: &str = "PATH=/usr/bin:/bin";

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn supervisor_with(max_log_lines: usize, default_environment: Vec<String>) -> Supervisor {
    Supervisor::new(Arc::new(Config {
        max_log_lines,
        default_environment,
        ..Config::default()
    }))
}

fn supervisor() -> Supervisor {
    supervisor_with(100, vec![PATH_ENV.to_string()])
}

// Poll until `cond` holds or five seconds pass.
async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn log_contains(sup: &Supervisor, name: &str, needle: &str) -> bool {
    sup.log_snapshot(name).await.iter().any(|l| l == needle)
}

async fn running(sup: &Supervisor, name: &str) -> bool {
    sup.get_status(&Target::Service(name.into())).await[name].running
}

#[tokio::test]
async fn immediate_exit_is_reported_as_early_exit() {
    let sup = supervisor();
    sup.register_service("worker", "/bin/true", vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    let err = sup.start_service("worker", vec![]).await.unwrap_err();
    assert!(matches!(err, SupervisorError::EarlyExit { .. }), "{err}");
    assert!(!running(&sup, "worker").await);
}

#[tokio::test]
async fn start_status_stop_long_running() {
    let sup = supervisor();
    sup.register_service("worker", &fixture("long_running.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    sup.start_service("worker", vec![]).await.unwrap();
    let status = sup.get_status(&Target::Service("worker".into())).await;
    let st = &status["worker"];
    assert!(st.running);
    assert!(st.pid > 0);
    assert_eq!(st.executable_path, fixture("long_running.sh"));
    assert_eq!(st.environment, vec![PATH_ENV.to_string()]);

    sup.stop_service("worker").await.unwrap();
    assert!(!running(&sup, "worker").await);

    // killed on purpose, so no exit line is recorded
    sleep(Duration::from_millis(300)).await;
    assert!(!sup.log_snapshot("worker").await.iter().any(|l| l.starts_with("exited:")));
}

#[tokio::test]
async fn service_can_be_restarted_after_stop() {
    let sup = supervisor();
    sup.register_service("worker", &fixture("long_running.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    sup.start_service("worker", vec![]).await.unwrap();
    let first = sup.get_status(&Target::All).await["worker"].pid;
    sup.stop_service("worker").await.unwrap();

    sup.start_service("worker", vec![]).await.unwrap();
    let second = sup.get_status(&Target::All).await["worker"].pid;
    assert_ne!(first, second);
    assert!(running(&sup, "worker").await);

    sup.stop_service("worker").await.unwrap();
}

#[tokio::test]
async fn unknown_service_is_rejected() {
    let sup = supervisor();
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    let err = sup.start_service("ghost", vec![]).await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownService { .. }));
    let err = sup.stop_service("ghost").await.unwrap_err();
    assert!(matches!(err, SupervisorError::UnknownService { .. }));

    // status still answers, with a stopped entry
    let status = sup.get_status(&Target::Service("ghost".into())).await;
    assert_eq!(status.len(), 1);
    assert!(!status["ghost"].running);
    assert!(sup.get_status(&Target::All).await.is_empty());
}

#[tokio::test]
async fn start_requires_spawn_timeout() {
    let sup = supervisor();
    sup.register_service("worker", &fixture("long_running.sh"), vec![]).await;

    let err = sup.start_service("worker", vec![]).await.unwrap_err();
    assert!(matches!(err, SupervisorError::TimeoutNotSet));
    assert!(err.is_configuration());
    assert!(!running(&sup, "worker").await);
    assert_eq!(sup.spawn_timeout().await, None);
}

#[tokio::test]
async fn second_start_conflicts_without_touching_the_process() {
    let sup = supervisor();
    sup.register_service("worker", &fixture("long_running.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;
    sup.start_service("worker", vec![]).await.unwrap();
    let pid = sup.get_status(&Target::All).await["worker"].pid;

    let err = sup.start_service("worker", vec![]).await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning { .. }));
    let status = sup.get_status(&Target::All).await;
    assert!(status["worker"].running);
    assert_eq!(status["worker"].pid, pid);

    sup.stop_service("worker").await.unwrap();
}

#[tokio::test]
async fn stop_of_stopped_service_fails() {
    let sup = supervisor();
    sup.register_service("worker", &fixture("long_running.sh"), vec![]).await;

    let err = sup.stop_service("worker").await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning { .. }));
}

#[tokio::test]
async fn stop_all_attempts_every_service() {
    let sup = supervisor();
    for name in ["a", "b", "c"] {
        sup.register_service(name, &fixture("long_running.sh"), vec![]).await;
    }
    sup.set_spawn_timeout(Duration::from_millis(50)).await;
    sup.start_service("b", vec![]).await.unwrap();

    let report = sup.stop_all().await;
    assert_eq!(report.len(), 3);
    assert_eq!(report.succeeded(), vec!["b"]);
    assert_eq!(report.failed(), vec!["a", "c"]);

    let agg = report.into_result().unwrap_err();
    assert_eq!(agg.len(), 2);
    assert!(matches!(agg.get("a"), Some(SupervisorError::NotRunning { .. })));
    assert!(matches!(agg.get("c"), Some(SupervisorError::NotRunning { .. })));
    assert!(agg.get("b").is_none());
    assert!(!running(&sup, "b").await);
}

#[tokio::test]
async fn bulk_stop_via_target_returns_aggregate() {
    let sup = supervisor();
    sup.register_service("a", &fixture("long_running.sh"), vec![]).await;
    sup.register_service("b", &fixture("long_running.sh"), vec![]).await;

    let err = sup.stop(&Target::parse("all")).await.unwrap_err();
    match err {
        SupervisorError::Aggregate(agg) => assert_eq!(agg.len(), 2),
        other => panic!("expected aggregate, got {other}"),
    }
    assert_eq!(Target::parse(""), Target::All);
}

#[tokio::test]
async fn start_all_collects_partial_failures() {
    let sup = supervisor();
    sup.register_service("good", &fixture("long_running.sh"), vec![]).await;
    sup.register_service("quits", "/bin/true", vec![]).await;
    sup.register_service("missing", "/nonexistent/worker", vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(100)).await;

    let report = sup.start_all(vec![]).await;
    assert_eq!(report.len(), 3);
    assert_eq!(report.succeeded(), vec!["good"]);

    let agg = report.into_result().unwrap_err();
    assert_eq!(agg.get("quits").map(|e| e.as_label()), Some("early_exit"));
    assert_eq!(agg.get("missing").map(|e| e.as_label()), Some("spawn_failed"));

    let status = sup.get_status(&Target::All).await;
    assert!(status["good"].running);
    assert!(!status["quits"].running);
    assert!(!status["missing"].running);

    sup.stop_service("good").await.unwrap();
}

#[tokio::test]
async fn output_lands_in_the_log() {
    let sup = supervisor();
    sup.register_service("worker", &fixture("long_running.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;
    sup.start_service("worker", vec![]).await.unwrap();

    assert!(eventually(|| log_contains(&sup, "worker", "worker ready")).await);
    assert!(eventually(|| log_contains(&sup, "worker", "warming up")).await);

    sup.stop_service("worker").await.unwrap();
}

#[tokio::test]
async fn early_exit_output_is_kept() {
    let sup = supervisor();
    sup.register_service("crash", &fixture("crash.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(300)).await;

    let err = sup.start_service("crash", vec![]).await.unwrap_err();
    match &err {
        SupervisorError::EarlyExit { status, .. } => assert_eq!(status, "exit status 3"),
        other => panic!("expected early exit, got {other}"),
    }
    assert!(eventually(|| log_contains(&sup, "crash", "missing config")).await);
    assert!(eventually(|| log_contains(&sup, "crash", "exited: exit status 3")).await);
    assert!(!running(&sup, "crash").await);
}

#[tokio::test]
async fn watcher_clears_record_on_unexpected_exit() {
    let sup = supervisor();
    sup.register_service("flaky", &fixture("late_crash.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    sup.start_service("flaky", vec![]).await.unwrap();
    assert!(running(&sup, "flaky").await);

    let s = &sup;
    assert!(eventually(|| async move { !running(s, "flaky").await }).await);
    assert!(eventually(|| log_contains(&sup, "flaky", "exited: exit status 2")).await);
    assert!(log_contains(&sup, "flaky", "lost connection").await);

    let err = sup.stop_service("flaky").await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning { .. }));
}

#[tokio::test]
async fn default_environment_is_used_when_none_given() {
    let sup = supervisor_with(100, vec![PATH_ENV.into(), "MODE=default".into()]);
    sup.register_service("env", &fixture("echo_env.sh"), vec!["EXTRA=1".into()]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    sup.start_service("env", vec![]).await.unwrap();
    assert!(eventually(|| log_contains(&sup, "env", "MODE=default")).await);
    let st = sup.get_status(&Target::All).await.remove("env").unwrap();
    assert_eq!(st.environment, vec![PATH_ENV, "MODE=default", "EXTRA=1"]);
    sup.stop_service("env").await.unwrap();

    sup.start_service("env", vec![PATH_ENV.into(), "MODE=custom".into()]).await.unwrap();
    assert!(eventually(|| log_contains(&sup, "env", "MODE=custom")).await);
    sup.stop_service("env").await.unwrap();
}

#[tokio::test]
async fn subscribers_only_see_lines_after_subscribing() {
    let sup = supervisor();
    sup.register_service("svc", "/bin/true", vec![]).await;

    let (_, mut early) = sup.subscribe("svc").await;
    sup.append_to_log("svc", "one").await.unwrap();
    let (_, mut late) = sup.subscribe("svc").await;
    sup.append_to_log("svc", "two").await.unwrap();
    sup.append_to_log("svc", "three").await.unwrap();

    for expected in ["one", "two", "three"] {
        assert_eq!(early.recv().await.as_deref(), Some(expected));
    }
    for expected in ["two", "three"] {
        assert_eq!(late.recv().await.as_deref(), Some(expected));
    }
    assert!(late.try_recv().is_err());
    assert_eq!(sup.log_snapshot("svc").await, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn subscriber_receives_live_process_output() {
    let sup = supervisor();
    sup.register_service("worker", &fixture("long_running.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;
    let (_, mut rx) = sup.subscribe("worker").await;

    sup.start_service("worker", vec![]).await.unwrap();
    let mut seen = Vec::new();
    while seen.len() < 2 {
        let line = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        seen.push(line);
    }
    seen.sort();
    assert_eq!(seen, vec!["warming up", "worker ready"]);

    sup.stop_service("worker").await.unwrap();
}

#[tokio::test]
async fn removed_or_reset_subscribers_stop_receiving() {
    let sup = supervisor();
    sup.register_service("svc", "/bin/true", vec![]).await;

    let (id, mut rx) = sup.subscribe("svc").await;
    assert!(sup.remove_log_subscriber("svc", id).await);
    assert!(!sup.remove_log_subscriber("svc", id).await);
    sup.append_to_log("svc", "after removal").await.unwrap();
    assert_eq!(rx.recv().await, None);

    let (_, mut rx) = sup.subscribe("svc").await;
    sup.register_service("svc", "/bin/true", vec![]).await;
    sup.append_to_log("svc", "after re-register").await.unwrap();
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn dead_subscriber_does_not_break_delivery() {
    let sup = supervisor();
    let (_, dead) = sup.subscribe("svc").await;
    drop(dead);
    let (_, mut alive) = sup.subscribe("svc").await;

    sup.append_to_log("svc", "still flowing").await.unwrap();
    assert_eq!(alive.recv().await.as_deref(), Some("still flowing"));
}

#[tokio::test]
async fn log_keeps_only_the_newest_lines() {
    let sup = supervisor_with(3, vec![]);
    for i in 0..5 {
        sup.append_to_log("svc", format!("line {i}")).await.unwrap();
    }
    assert_eq!(sup.log_snapshot("svc").await, vec!["line 2", "line 3", "line 4"]);
    assert!(sup.log_snapshot("other").await.is_empty());
}

#[tokio::test]
async fn zero_log_capacity_fails_fast() {
    let sup = supervisor_with(0, vec![]);
    let err = sup.append_to_log("svc", "x").await.unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidLogCapacity { capacity: 0 }));
}

#[tokio::test]
async fn registered_services_are_listed() {
    let sup = supervisor();
    sup.register_service("b", "/bin/true", vec![]).await;
    sup.register_service("a", "/bin/true", vec![]).await;
    sup.register_service("a", "/bin/false", vec![]).await;
    assert_eq!(sup.services().await, vec!["a", "b"]);
    assert_eq!(sup.get_status(&Target::All).await.len(), 2);
}

// A variable of the test process that the shell would not invent on its own.
fn inherited_key() -> Option<String> {
    std::env::vars()
        .map(|(key, _)| key)
        .filter(|key| !matches!(key.as_str(), "PATH" | "PWD" | "OLDPWD" | "SHLVL" | "_" | "IFS" | "PS1" | "PS2" | "PS4" | "HOME"))
        .find(|key| key.chars().all(|c| c.is_ascii_uppercase() || c == '_'))
}

#[tokio::test]
async fn empty_environment_inherits_the_supervisor_environment() {
    let Some(key) = inherited_key() else {
        return;
    };
    let sup = supervisor_with(100, vec![]);
    sup.register_service("env", &fixture("export_env.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    sup.start_service("env", vec![]).await.unwrap();
    let s = &sup;
    let k = key.as_str();
    let seen = eventually(|| async move {
        s.log_snapshot("env").await.iter().any(|l| l.contains(&format!(" {k}=")))
    })
    .await;
    assert!(seen, "{key} was not passed through");
    assert!(sup.get_status(&Target::All).await["env"].environment.is_empty());
    sup.stop_service("env").await.unwrap();
}

#[tokio::test]
async fn explicit_environment_replaces_the_supervisor_environment() {
    let Some(key) = inherited_key() else {
        return;
    };
    let sup = supervisor_with(100, vec![]);
    sup.register_service("env", &fixture("export_env.sh"), vec!["MARKER=1".into()]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;

    sup.start_service("env", vec![PATH_ENV.into()]).await.unwrap();
    let s = &sup;
    assert!(eventually(|| async move {
        s.log_snapshot("env").await.iter().any(|l| l.contains(" MARKER="))
    })
    .await);
    let log = sup.log_snapshot("env").await;
    assert!(!log.iter().any(|l| l.contains(&format!(" {key}="))), "{key} leaked: {log:?}");
    sup.stop_service("env").await.unwrap();
}

#[tokio::test]
async fn bulk_stop_error_omits_successful_kills() {
    let sup = supervisor();
    sup.register_service("a", &fixture("long_running.sh"), vec![]).await;
    sup.register_service("b", &fixture("long_running.sh"), vec![]).await;
    sup.set_spawn_timeout(Duration::from_millis(50)).await;
    sup.start(&Target::All, vec![]).await.unwrap();

    // every service was running, so the folded result has nothing to report
    sup.stop(&Target::All).await.unwrap();
    assert!(!running(&sup, "a").await);
    assert!(!running(&sup, "b").await);

    // the per-service report still names all of them
    sup.start(&Target::All, vec![]).await.unwrap();
    let report = sup.stop_all().await;
    assert_eq!(report.len(), 2);
    assert_eq!(report.succeeded(), vec!["a", "b"]);
}
