//! Integration tests for the `subproc` binary.

use assert_cmd::Command;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use predicates::str::contains;
use std::io::{BufRead, BufReader};
use std::process::Stdio;

fn subproc() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("subproc").expect("binary `subproc` should be built")
}

#[test]
fn test_exit_code_is_passed_through() {
    subproc().arg("exit 3").assert().code(3);
}

#[test]
fn test_piped_output_is_relayed() {
    subproc()
        .args(["-o", "pipe", "-e", "stdout", "--input", "b\na\n", "sort"])
        .assert()
        .success()
        .stdout("a\nb\n");
}

#[test]
fn test_file_stdin_is_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.txt");
    std::fs::write(&path, "from-file\n").unwrap();

    subproc()
        .args(["-i", path.to_str().unwrap(), "-o", "pipe", "cat"])
        .assert()
        .success()
        .stdout("from-file\n");
}

#[test]
fn test_missing_command_exits_127() {
    subproc()
        .args(["-e", "pipe", "no-such-command-xyz", "arg"])
        .assert()
        .code(127)
        .stderr(contains("no-such-command-xyz"));
}

#[test]
fn test_sigterm_is_forwarded_to_child() {
    #[allow(deprecated)]
    let binary = assert_cmd::cargo::cargo_bin("subproc");
    let mut wrapper = std::process::Command::new(binary)
        .arg("echo ready; exec sleep 5")
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    // The child is running once it has printed, so handlers are in place
    let mut line = String::new();
    BufReader::new(wrapper.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line, "ready\n");

    kill(Pid::from_raw(wrapper.id() as i32), Signal::SIGTERM).unwrap();
    let status = wrapper.wait().unwrap();
    assert_eq!(status.code(), Some(128 + Signal::SIGTERM as i32));
}
