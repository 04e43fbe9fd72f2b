//! Console agent end-to-end behavior, driven through `/bin/sh` standing in
//! for a JavaScript engine. The shell ignores the staged entry file (it
//! arrives as `$0` after `-c`), which lets every process-lifecycle path run
//! without any engine installed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use jshost::{
    Agent, AgentConfig, ConsoleAgent, EvalOptions, HarnessError, HostKind, Phase, TestRecord,
};

fn sh_agent(script: &str) -> ConsoleAgent {
    let config = AgentConfig::new("/bin/sh").host_arguments(vec!["-c".to_string(), script.to_string()]);
    ConsoleAgent::new(HostKind::Node, config).unwrap()
}

async fn eval(agent: &ConsoleAgent, source: &str) -> jshost::ExecutionResult {
    agent
        .eval_script(source.into(), EvalOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn captures_stdout() {
    let agent = sh_agent("printf 'foo\nbar\n'");
    let result = eval(&agent, "print('ignored');").await;
    assert_eq!(result.stdout, "foo\nbar\n");
    assert_eq!(result.stderr, "");
    assert!(result.error.is_none());
    assert_eq!(agent.phase(), Phase::Idle);
}

#[tokio::test]
async fn stderr_error_signature_is_parsed() {
    let agent = sh_agent(
        "printf 'TypeError: x is not a function\n    at foo (/tmp/f.js:3:5)\n' 1>&2",
    );
    let result = eval(&agent, "x();").await;
    let error = result.error.expect("stderr carried an error signature");
    assert_eq!(error.name, "TypeError");
    assert_eq!(error.message.as_deref(), Some("x is not a function"));
    assert_eq!(error.stack.len(), 1);
    assert_eq!(error.stack[0].line_number, 3);
}

#[tokio::test]
async fn nonzero_exit_without_signature_is_not_an_error() {
    let agent = sh_agent("exit 3");
    let result = eval(&agent, "whatever();").await;
    assert_eq!(result.stdout, "");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn unexpected_signal_lands_in_stderr() {
    let agent = sh_agent("kill -TERM $$");
    let result = eval(&agent, "loop();").await;
    assert!(
        result.stderr.contains("signal 15"),
        "stderr should name the signal: {:?}",
        result.stderr
    );
}

#[tokio::test]
async fn stop_kills_a_wedged_host_and_resolves_empty() {
    let agent = Arc::new(sh_agent("sleep 30"));
    let runner = agent.clone();
    let started = Instant::now();

    let pending =
        tokio::spawn(async move { eval(&runner, "while(true);").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(agent.stop().await.unwrap(), "an evaluation was in flight");
    let result = pending.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10), "stop must not wait for sleep");
    assert_eq!(result, jshost::ExecutionResult::empty());
    assert_eq!(agent.phase(), Phase::Idle);
}

#[tokio::test]
async fn stop_with_nothing_running_reports_false() {
    let agent = sh_agent("true");
    assert!(!agent.stop().await.unwrap());
}

#[tokio::test]
async fn stop_at_dispatch_suppresses_the_spawn() {
    // The evaluation would leave a marker file if the host ever ran.
    let dir = tempfile::TempDir::new().unwrap();
    let marker = dir.path().join("spawned");
    let agent = Arc::new(sh_agent(&format!("touch {}", marker.display())));

    let runner = agent.clone();
    let pending = tokio::spawn(async move { eval(&runner, "x").await });
    // No yield before the stop: the evaluation future has not been polled,
    // so no subprocess can exist yet.
    agent.stop().await.unwrap();

    let result = pending.await.unwrap();
    assert_eq!(result, jshost::ExecutionResult::empty());
    assert!(!marker.exists(), "spawn should have been suppressed");
    assert_eq!(agent.phase(), Phase::Idle);
}

#[tokio::test]
async fn staging_failure_rejects_and_resets() {
    let config = AgentConfig::new("/bin/sh").out("/proc/jshost-no-such-dir/sub");
    let agent = ConsoleAgent::new(HostKind::Node, config).unwrap();

    let err = agent
        .eval_script("print(1);".into(), EvalOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Stage { .. }));

    // The failed call must not leave the state machine mid-flight.
    assert_eq!(agent.phase(), Phase::Idle);
    assert!(!agent.stop().await.unwrap());
}

#[tokio::test]
async fn agent_survives_a_stop_and_evaluates_again() {
    let agent = Arc::new(sh_agent("sleep 30"));
    let runner = agent.clone();
    let pending = tokio::spawn(async move { eval(&runner, "x").await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    agent.stop().await.unwrap();
    pending.await.unwrap();

    // Same agent, second call: the stale cancellation must not suppress it.
    let runner = agent.clone();
    let pending = tokio::spawn(async move { eval(&runner, "x").await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.phase(), Phase::Running, "second call really spawned");
    agent.stop().await.unwrap();
    assert_eq!(pending.await.unwrap(), jshost::ExecutionResult::empty());
}

#[tokio::test]
async fn spawn_failure_rejects_after_retry() {
    let config = AgentConfig::new("/nonexistent/js-engine");
    let agent = ConsoleAgent::new(HostKind::Node, config).unwrap();
    let err = agent
        .eval_script("print(1);".into(), EvalOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Spawn { .. }));
    assert_eq!(agent.phase(), Phase::Idle);
}

#[tokio::test]
async fn staged_entry_carries_shim_and_teardown() {
    // `cat "$0"` echoes the staged entry file back through stdout.
    let agent = sh_agent("cat \"$0\"");
    let result = eval(&agent, "print('body');").await;
    assert!(result.stdout.contains("var $262"), "shim was spliced in");
    assert!(result.stdout.contains("print('body');"));
    assert!(result.stdout.contains(";$262.destroy();"));
}

#[tokio::test]
async fn raw_record_is_staged_byte_for_byte() {
    let agent = sh_agent("cat \"$0\"");
    let record: TestRecord = serde_json::from_value(serde_json::json!({
        "file": "/t/raw.js",
        "contents": "RAW CONTENT",
        "attrs": { "flags": { "raw": true } }
    }))
    .unwrap();
    let result = agent
        .eval_script(record.into(), EvalOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout, "RAW CONTENT");
}

#[tokio::test]
async fn module_record_stages_transitive_dependencies() {
    let fixture = tempfile::TempDir::new().unwrap();
    std::fs::write(fixture.path().join("entry.js"), "import './dep.js';\n").unwrap();
    std::fs::write(fixture.path().join("dep.js"), "import './leaf.js';\n").unwrap();
    std::fs::write(fixture.path().join("leaf.js"), "export var leaf = 1;\n").unwrap();

    let staging = tempfile::TempDir::new().unwrap();
    let config = AgentConfig::new("/bin/sh")
        .host_arguments(vec![
            "-c".to_string(),
            // List the staging directory so the test can see what landed.
            "ls \"$(dirname \"$0\")\"".to_string(),
        ])
        .out(staging.path());
    let agent = ConsoleAgent::new(HostKind::Node, config).unwrap();

    let record = TestRecord {
        file: fixture.path().join("entry.js"),
        contents: std::fs::read_to_string(fixture.path().join("entry.js")).unwrap(),
        attrs: serde_json::from_value(serde_json::json!({ "flags": { "module": true } })).unwrap(),
    };
    let result = agent
        .eval_script(record.into(), EvalOptions::default())
        .await
        .unwrap();

    assert!(result.stdout.contains("dep.js"), "stdout: {}", result.stdout);
    assert!(result.stdout.contains("leaf.js"), "stdout: {}", result.stdout);

    // Cleanup removed everything that was staged for the call.
    let leftovers: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "staged files linger: {leftovers:?}");
}

#[tokio::test]
async fn per_call_host_args_are_appended() {
    // After `-c script argv0`, the per-call argument is $1 and the staged
    // entry path $2.
    let config = AgentConfig::new("/bin/sh").host_arguments(vec![
        "-c".to_string(),
        "printf '%s' \"$1\"".to_string(),
        "argv0".to_string(),
    ]);
    let agent = ConsoleAgent::new(HostKind::Node, config).unwrap();
    let options = EvalOptions {
        test_host_args: vec!["per-call".to_string()],
        ..Default::default()
    };
    let result = agent
        .eval_script("x".into(), options)
        .await
        .unwrap();
    assert_eq!(result.stdout, "per-call");
}

#[test]
fn transform_reaches_the_staged_source() {
    let config = AgentConfig::new("/bin/sh")
        .transform(Arc::new(|code| code.replace("BEFORE", "AFTER")));
    let agent = ConsoleAgent::new(HostKind::Node, config).unwrap();
    let out = agent.compile("BEFORE();", &EvalOptions::default());
    assert!(out.contains("AFTER();"));
    assert!(!out.contains("BEFORE"));
}

#[test]
fn unknown_host_fails_before_any_agent_exists() {
    let err = HostKind::parse("unheard-of").unwrap_err();
    assert!(matches!(err, HarnessError::UnknownHost { .. }));
    assert!(err.to_string().contains("node"));
}

#[test]
fn staging_names_are_opaque() {
    let name = jshost::stage::unique_entry_name();
    assert!(name.starts_with("f-"));
    assert!(name.ends_with(".js"));
}
