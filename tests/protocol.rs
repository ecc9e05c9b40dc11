//! End-to-end coverage of the control protocol against the built binary:
//! real stdin/stdout, no mocking of the framer.

use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

fn agent_bin() -> &'static str {
    option_env!("CARGO_BIN_EXE_termux-agent")
        .or(option_env!("CARGO_BIN_EXE_termux_agent"))
        .expect("termux-agent test binary not built")
}

fn spawn_agent() -> std::process::Child {
    Command::new(agent_bin())
        .env("RUST_LOG", "error")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn termux-agent")
}

fn send_request(stdin: &mut impl Write, lines: &[&str]) {
    for line in lines {
        writeln!(stdin, "{line}").expect("write request line");
    }
    writeln!(stdin).expect("write terminating blank line");
    stdin.flush().expect("flush request");
}

#[test]
fn quit_ends_cleanly_with_zero_status() {
    let mut child = spawn_agent();
    let mut stdin = child.stdin.take().expect("stdin");
    let stdout = child.stdout.take().expect("stdout");
    let mut lines = BufReader::new(stdout).lines();

    send_request(&mut stdin, &["quit"]);

    let begin = lines.next().expect("begin line").expect("read begin");
    assert!(begin.starts_with("begin "), "got: {begin}");
    let id = begin.trim_start_matches("begin ").to_string();

    let end = lines.next().expect("end line").expect("read end");
    assert_eq!(end, format!("end {id} 0"));

    drop(stdin);
    let status = child.wait().expect("wait for agent exit");
    assert!(status.success());
}

#[test]
fn unknown_verb_aborts_and_exits_nonzero() {
    let mut child = spawn_agent();
    let mut stdin = child.stdin.take().expect("stdin");
    let stdout = child.stdout.take().expect("stdout");
    let mut lines = BufReader::new(stdout).lines();

    send_request(&mut stdin, &["frobnicate"]);

    let abort = lines.next().expect("abort line").expect("read abort");
    assert!(abort.starts_with("abort "), "got: {abort}");

    let status = child.wait().expect("wait for agent exit");
    assert!(!status.success());
}

#[test]
fn poll_with_nothing_registered_is_an_empty_diff() {
    let mut child = spawn_agent();
    let mut stdin = child.stdin.take().expect("stdin");
    let stdout = child.stdout.take().expect("stdout");
    let mut lines = BufReader::new(stdout).lines();

    send_request(&mut stdin, &["poll"]);
    let begin = lines.next().expect("begin").expect("read begin");
    assert!(begin.starts_with("begin "));
    let id = begin.trim_start_matches("begin ").to_string();
    let end = lines.next().expect("end").expect("read end");
    assert_eq!(end, format!("end {id} 0"), "poll should report no diff lines");

    send_request(&mut stdin, &["quit"]);
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn run_spawns_a_child_and_echoes_its_output() {
    let mut child = spawn_agent();
    let mut stdin = child.stdin.take().expect("stdin");
    let stdout = child.stdout.take().expect("stdout");
    let mut lines = BufReader::new(stdout).lines();

    send_request(&mut stdin, &["run", "echo hi"]);

    let begin = lines.next().expect("begin").expect("read begin");
    assert!(begin.starts_with("begin "));
    let pid_line = lines.next().expect("pid payload").expect("read pid");
    let pid: i32 = pid_line.trim().parse().expect("pid payload is an integer");
    assert!(pid > 0);
    let end = lines.next().expect("end").expect("read end");
    assert!(end.ends_with(" 0"), "run did not report success: {end}");

    let mut saw_output = false;
    let mut saw_terminate = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        let Some(Ok(line)) = lines.next() else { break };
        if line.starts_with("%output") {
            saw_output = true;
        }
        if line.starts_with(&format!("%terminate {pid}")) {
            saw_terminate = true;
            break;
        }
    }
    assert!(saw_output, "expected at least one %output frame from echo");
    assert!(saw_terminate, "expected a %terminate event for the spawned pid");

    send_request(&mut stdin, &["quit"]);
    drop(stdin);
    let _ = child.wait();
}

#[test]
fn login_spawns_the_shell_in_the_requested_cwd() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let dir = tempfile::tempdir().expect("make scratch cwd");
    let canonical = std::fs::canonicalize(dir.path()).expect("canonicalize scratch cwd");

    let mut child = spawn_agent();
    let mut stdin = child.stdin.take().expect("stdin");
    let stdout = child.stdout.take().expect("stdout");
    let mut lines = BufReader::new(stdout).lines();

    send_request(&mut stdin, &["login", canonical.to_str().unwrap()]);
    assert!(lines.next().unwrap().unwrap().starts_with("begin "));
    let pid: i32 = lines.next().unwrap().unwrap().trim().parse().expect("pid payload");
    let end = lines.next().unwrap().unwrap();
    assert!(end.ends_with(" 0"), "login did not report success: {end}");

    let payload = BASE64.encode(b"pwd\n");
    send_request(&mut stdin, &["send", &pid.to_string(), &payload]);
    assert!(lines.next().unwrap().unwrap().starts_with("begin "));
    assert!(lines.next().unwrap().unwrap().ends_with(" 0"));

    let mut saw_cwd = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        let Some(Ok(line)) = lines.next() else { break };
        if line.starts_with("%output") || line.starts_with("%end") {
            continue;
        }
        if let Ok(decoded) = BASE64.decode(line.trim()) {
            if String::from_utf8_lossy(&decoded).contains(canonical.to_str().unwrap()) {
                saw_cwd = true;
                break;
            }
        }
    }
    assert!(saw_cwd, "expected the login shell's pwd output to contain the requested cwd");

    send_request(&mut stdin, &["quit"]);
    drop(stdin);
    let _ = child.wait();
}
