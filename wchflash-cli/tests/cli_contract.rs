//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, std::path::Path, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("wchflash");
    cmd.env_remove("WCHFLASH_CONFIG")
        .env_remove("WCHFLASH_SIMULATE")
        .env_remove("RUST_LOG");
    cmd
}

/// Config that keeps the simulator fast.
fn fast_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("fast.toml");
    fs::write(&path, "[engine]\nstep_delay_ms = 0\n").expect("write config");
    path
}

fn write_firmware(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, vec![0xA5u8; len]).expect("write firmware");
    path
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("wchflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("wchflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn chips_json_lists_table() {
    let output = cli_cmd()
        .args(["chips", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    let chips = parsed["data"]["chips"].as_array().expect("chip array");
    assert!(chips.iter().any(|c| c["name"] == "CH32V307VCT6"));
}

#[test]
fn devices_json_includes_simulated_device() {
    let output = cli_cmd()
        .args(["--simulate", "devices", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    let devices = parsed["data"]["devices"].as_array().expect("device array");
    assert_eq!(devices[0]["locator"], "sim:0");
    assert_eq!(devices[0]["vid"], 0x4348);
    assert_eq!(devices[0]["transport"], "usb-isp");
}

#[test]
fn info_json_describes_firmware() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = write_firmware(dir.path(), "app.bin", 4096);
    let output = cli_cmd()
        .arg("info")
        .arg("--json")
        .arg(&fw)
        .output()
        .expect("command should execute");
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(parsed["data"]["format"], "binary");
    assert_eq!(parsed["data"]["size"], 4096);
    assert_eq!(parsed["data"]["large"], false);
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("not_exists.bin");
    cli_cmd()
        .arg("info")
        .arg("--json")
        .arg(&missing)
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn info_rejects_unsupported_extension() {
    let dir = tempdir().expect("tempdir should be created");
    let notes = write_firmware(dir.path(), "notes.txt", 128);
    cli_cmd()
        .arg("info")
        .arg(&notes)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unsupported firmware format"));
}

#[test]
fn simulated_identify_prints_marked_chip() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .arg("--simulate")
        .arg("--config")
        .arg(fast_config(dir.path()))
        .arg("identify")
        .assert()
        .success()
        .stdout(predicate::str::contains("CH32V307VCT6[0x7017] (simulated)"));
}

#[test]
fn simulated_flash_completes() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = write_firmware(dir.path(), "app.bin", 8192);
    cli_cmd()
        .arg("--simulate")
        .arg("--config")
        .arg(fast_config(dir.path()))
        .arg("flash")
        .arg(&fw)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Flashing completed"));
}

#[test]
fn simulate_env_var_is_honoured() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = write_firmware(dir.path(), "app.bin", 1024);
    cli_cmd()
        .env("WCHFLASH_SIMULATE", "true")
        .env("WCHFLASH_CONFIG", fast_config(dir.path()))
        .args(["-q", "flash"])
        .arg(&fw)
        .assert()
        .success();
}

#[test]
fn simulated_verify_fault_fails_flash() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("faulty.toml");
    fs::write(&config, "[engine]\nstep_delay_ms = 0\nfault = \"verify\"\n").expect("write config");
    let fw = write_firmware(dir.path(), "app.bin", 1024);
    cli_cmd()
        .arg("--simulate")
        .arg("--config")
        .arg(&config)
        .arg("flash")
        .arg(&fw)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Verify failed"));
}

#[test]
fn simulated_verify_fault_skipped_with_no_verify() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("faulty.toml");
    fs::write(&config, "[engine]\nstep_delay_ms = 0\nfault = \"verify\"\n").expect("write config");
    let fw = write_firmware(dir.path(), "app.bin", 1024);
    cli_cmd()
        .args(["--simulate", "--config"])
        .arg(&config)
        .arg("flash")
        .arg(&fw)
        .arg("--no-verify")
        .assert()
        .success();
}

#[test]
fn flash_rejects_truncated_firmware() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = write_firmware(dir.path(), "tiny.bin", 8);
    cli_cmd()
        .arg("--simulate")
        .arg("flash")
        .arg(&fw)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("empty or truncated"));
}

#[test]
fn non_interactive_erase_skips_prompt() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .args(["--simulate", "--non-interactive", "--config"])
        .arg(fast_config(dir.path()))
        .arg("erase")
        .assert()
        .success()
        .stderr(predicate::str::contains("Erase completed"));
}

#[test]
fn simulated_watch_flashes_requested_count() {
    let dir = tempdir().expect("tempdir should be created");
    let fw = write_firmware(dir.path(), "app.bin", 512);
    cli_cmd()
        .args(["--simulate", "--config"])
        .arg(fast_config(dir.path()))
        .arg("watch")
        .arg(&fw)
        .args(["--count", "2"])
        .assert()
        .success()
        .stderr(predicate::str::contains("2 flashed, 0 failed"));
}

#[test]
fn invalid_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("wchflash.toml"), "invalid toml [[[").expect("write invalid config");
    let output = cli_cmd()
        .current_dir(dir.path())
        .args(["chips"])
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}

#[test]
fn invalid_config_value_is_an_error() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir.path().join("bad.toml");
    fs::write(&config, "[engine]\npreference = \"quantum\"\n").expect("write config");
    cli_cmd()
        .arg("--config")
        .arg(&config)
        .arg("identify")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("quantum"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_zero_for_completions() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("wchflash"));
}

#[test]
fn exit_code_two_for_missing_completion_shell() {
    cli_cmd()
        .arg("completions")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("shell"));
}

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .code(2);
}

#[test]
fn flash_without_firmware_is_usage_error() {
    cli_cmd()
        .arg("flash")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("FIRMWARE"));
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("falsh")
        .assert()
        .failure()
        .stderr(predicate::str::contains("flash"));
}
