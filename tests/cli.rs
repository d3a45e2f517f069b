use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

fn cisug_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cisug"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_path = config_dir.join("cisug.toml");
    fs::write(
        &config_path,
        format!(
            r#"[source]
instance = "127.0.0.1:9"

[storage]
data_dir = "{}/data"

[logging]
level = "warn"
"#,
            root.display()
        ),
    )
    .unwrap();

    (tmp, config_path)
}

fn run_cisug(config: &PathBuf, args: &[&str]) -> std::process::Output {
    Command::new(cisug_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("CISUG_LOG")
        .output()
        .expect("failed to run cisug")
}

#[test]
fn stats_on_empty_data_dir() {
    let (_tmp, config) = setup_test_env();
    let output = run_cisug(&config, &["stats"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("not built"), "stdout: {}", stdout);
}

#[test]
fn missing_config_exits_non_zero() {
    let output = Command::new(cisug_binary())
        .arg("--config")
        .arg("/nonexistent/cisug.toml")
        .arg("stats")
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn suggest_without_index_exits_non_zero() {
    let (_tmp, config) = setup_test_env();
    fs::write(
        &config,
        fs::read_to_string(&config).unwrap()
            + "\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n",
    )
    .unwrap();

    let output = run_cisug(&config, &["suggest", "database failover"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cisug index"), "stderr: {}", stderr);
}

#[test]
fn invalid_progress_mode_is_rejected() {
    let (_tmp, config) = setup_test_env();
    let output = run_cisug(&config, &["--progress", "loud", "stats"]);
    assert!(!output.status.success());
}
