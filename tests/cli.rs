use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_realm-sandbox");

fn cli() -> Command {
    let mut command = Command::new(BIN);
    command
        .env_remove("REALM_SANDBOX_MODULE_REALMS")
        .env_remove("REALM_SANDBOX_ECHO_CONSOLE")
        .env_remove("REALM_SANDBOX_ALLOWED_ORIGINS")
        .env_remove("RUST_LOG");
    command
}

#[test]
fn test_single_shot_prints_result() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("add.js");
    fs::write(&file, "export const add = (a, b) => a + b;").unwrap();

    let output = cli()
        .arg("--experimental-vm-modules")
        .arg(&file)
        .arg("add")
        .arg("[2, 40]")
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "42");
}

#[test]
fn test_missing_capability_fails() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("mod.js");
    fs::write(&file, "export const x = 1;").unwrap();

    let output = cli().arg(&file).output().unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not enabled"));
}

#[test]
fn test_uncaught_without_callback_terminates() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("boom.js");
    fs::write(&file, "throw new Error('top level boom');").unwrap();

    let output = cli()
        .arg("--experimental-vm-modules")
        .arg("--no-error-callback")
        .arg(&file)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Uncaught"));
    assert!(stderr.contains("top level boom"));
}

#[test]
fn test_uncaught_with_callback_reports_and_fails() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("boom.js");
    fs::write(&file, "throw new Error('delivered boom');").unwrap();

    let output = cli()
        .arg("--experimental-vm-modules")
        .arg(&file)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: "));
    assert!(stderr.contains("delivered boom"));
    assert!(!stderr.contains("Uncaught sandboxed"));
}

#[test]
fn test_invalid_insulation_flag() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("mod.js");
    fs::write(&file, "export const x = 1;").unwrap();

    let output = cli()
        .arg("--experimental-vm-modules")
        .arg("--insulation=maybe")
        .arg(&file)
        .output()
        .unwrap();

    assert!(!output.status.success());
}

#[test]
fn test_server_mode_protocol() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("greet.js");
    fs::write(
        &file,
        "export const greet = (name) => `hi ${name}`;\n\
         export const fail = () => { throw new Error('nope'); };",
    )
    .unwrap();

    let mut child = cli()
        .arg("--experimental-vm-modules")
        .arg("--server")
        .arg(&file)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    {
        let stdin = child.stdin.as_mut().unwrap();
        stdin.write_all(b"greet\n[\"ada\"]\nfail\n[]\nmissing\n[]\n").unwrap();
    }
    drop(child.stdin.take());

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.starts_with("Status:Ok\nLength:8\n\n\"hi ada\""));
    assert!(stdout.contains("Status:Error"));
    assert!(stdout.contains("nope"));
    assert!(stdout.contains("function name not exist: missing"));
}
