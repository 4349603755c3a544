use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn run_cli(args: &[&str], cwd: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_helm"))
        .args(args)
        .current_dir(cwd)
        .env_remove("HELM_CONFIG")
        .env_remove("HELM_LINK_URL")
        .output()
        .expect("helm should run")
}

fn write_config(dir: &TempDir, source: &str) -> String {
    let path = dir.path().join("helm.toml");
    std::fs::write(&path, source).expect("config write should succeed");
    path.display().to_string()
}

#[test]
fn check_config_prints_effective_settings() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(
        &dir,
        r#"
        [link]
        url = "ws://agent:9000/ws"
        completion_timeout_ms = 30000

        [[relay]]
        kind = "browser"
        host = "10.0.0.2"
        port = 5900
        "#,
    );

    let output = run_cli(&["--config", &path, "check-config"], dir.path());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "check-config failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("link.url: ws://agent:9000/ws"));
    assert!(stdout.contains("link.completion_timeout_ms: 30000"));
    assert!(stdout.contains("engine.stop_on_failure: false"));
    assert!(stdout.contains("relay.browser: 10.0.0.2:5900"));
}

#[test]
fn check_config_json_round_trips_sections() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "[engine]\nstop_on_failure = true\n");

    let output = run_cli(&["check-config", "--json", "--config", &path], dir.path());
    assert!(output.status.success());
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("check-config --json should print JSON");
    assert_eq!(value["engine"]["stop_on_failure"], true);
    assert_eq!(value["server"]["bind"], "127.0.0.1:8080");
    assert_eq!(value["relay"], serde_json::json!([]));
}

#[test]
fn invalid_config_exits_with_error() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, "[link]\nreconnect_delay_ms = 0\n");

    let output = run_cli(&["--config", &path, "check-config"], dir.path());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("error: invalid config"));
    assert!(stderr.contains("reconnect_delay_ms must be positive"));
}
