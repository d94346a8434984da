//! The `fleet` binary end to end.

use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Output, Stdio};

use crate::common::{FLEET_BIN, Fixture, HOST_BIN};

fn fleet(fixture: &Fixture, args: &[&str]) -> Output {
    Command::new(FLEET_BIN)
        .args(args)
        .current_dir(fixture.path())
        .env("FLEET_CONFIG", &fixture.config)
        .env_remove("FLEET_INTERACTIVE")
        .env_remove("FLEET_WATCH")
        .env_remove("FLEET_MAX_WORKERS")
        .output()
        .unwrap()
}

#[test]
fn passing_run_exits_zero() {
    let fixture = Fixture::new();
    let output = fleet(&fixture, &["--max-workers", "2", "a.test", "b.test", "c.test"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "{stdout}");
    assert_eq!(stdout.matches("PASS ").count(), 3, "{stdout}");
    assert!(stdout.contains("3 passed, 0 failed, 0 not run, 3 total"), "{stdout}");
    assert!(fixture.path().join("logs").join("fleet.log").is_file());
}

#[test]
fn failing_task_sets_the_exit_code() {
    let fixture = Fixture::new();
    let output = fleet(&fixture, &["--watch", "a.test", "fail.test"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(1), "{stdout}");
    assert!(stdout.contains("FAIL "), "{stdout}");
    assert!(stdout.contains("assertion failed in fail.test"), "{stdout}");
}

#[test]
fn help_and_usage_errors() {
    let fixture = Fixture::new();

    let help = fleet(&fixture, &["--help"]);
    assert!(help.status.success());
    assert!(String::from_utf8_lossy(&help.stdout).contains("Usage: fleet"));

    let bad = fleet(&fixture, &["--max-workers", "zero", "a.test"]);
    assert_eq!(bad.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&bad.stderr).contains("--max-workers"));
}

#[test]
fn interactive_session_replays_on_enter() {
    let fixture = Fixture::new();
    let mut child = Command::new(FLEET_BIN)
        .args(["--interactive", "a.test", "fail.test"])
        .current_dir(fixture.path())
        .env("FLEET_CONFIG", &fixture.config)
        .env_remove("FLEET_WATCH")
        .env_remove("FLEET_MAX_WORKERS")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    let stdout = BufReader::new(child.stdout.take().unwrap());

    let mut summaries = Vec::new();
    let mut passes = 0;
    for line in stdout.lines() {
        let line = line.unwrap();
        passes += usize::from(line.starts_with("PASS "));
        if line.ends_with(" total") {
            summaries.push(line);
            if summaries.len() == 2 {
                break;
            }
            writeln!(stdin).unwrap();
        }
    }
    child.kill().unwrap();
    child.wait().unwrap();

    assert_eq!(
        summaries,
        ["1 passed, 1 failed, 0 not run, 2 total"; 2],
        "replay should rerun both tasks"
    );
    assert_eq!(passes, 2);
}

#[test]
fn host_env_from_config_reaches_the_executor() {
    let fixture = Fixture::new();
    fixture.extend_config("[host]\nenv = { FLEET_GREETING = \"from-config\" }\n");

    let output = fleet(&fixture, &["greet.test"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1), "{stdout}");
    assert!(stdout.contains("greeting=from-config"), "{stdout}");
}

#[test]
fn host_program_and_args_from_config_wrap_the_host() {
    let fixture = Fixture::new();
    fixture.extend_config(&format!(
        "[host]\nprogram = \"env\"\nargs = [\"FLEET_GREETING=from-wrapper\", {HOST_BIN:?}]\n"
    ));

    let output = fleet(&fixture, &["a.test", "greet.test"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("PASS "), "{stdout}");
    assert!(stdout.contains("greeting=from-wrapper"), "{stdout}");
}
