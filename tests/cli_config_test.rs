use std::process::Command;
use tempfile::TempDir;

fn watchmux(dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_watchmux"));
    cmd.current_dir(dir);
    cmd
}

#[test]
fn test_init_command() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();

    let output = watchmux(temp_path)
        .arg("init")
        .output()
        .expect("Failed to run init command");
    assert!(output.status.success());

    let config_path = temp_path.join(".watchmux/settings.toml");
    assert!(config_path.exists());

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("version = 1"));
    assert!(content.contains("[watcher]"));
    assert!(content.contains("subtree_watching = true"));
    assert!(content.contains("[logging]"));

    // A second init without --force refuses to overwrite
    let output = watchmux(temp_path).arg("init").output().unwrap();
    assert!(!output.status.success());

    let output = watchmux(temp_path)
        .args(["init", "--force"])
        .output()
        .unwrap();
    assert!(output.status.success());
}

#[test]
fn test_config_command() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();

    let config_dir = temp_path.join(".watchmux");
    std::fs::create_dir_all(&config_dir).unwrap();
    let config_content = r#"
version = 2
[watcher]
dispatch_threads = 99
"#;
    std::fs::write(config_dir.join("settings.toml"), config_content).unwrap();

    let output = watchmux(temp_path)
        .arg("config")
        .output()
        .expect("Failed to run config command");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("version = 2"));
    assert!(stdout.contains("dispatch_threads = 99"));
}

#[test]
fn test_watch_rejects_missing_directory() {
    let temp_dir = TempDir::new().unwrap();

    let output = watchmux(temp_dir.path())
        .args(["watch", "does-not-exist"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Cannot watch"));
}
