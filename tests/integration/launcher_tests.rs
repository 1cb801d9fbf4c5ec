//! Integration tests for the launcher loop and its client, over real FIFOs
//! with the launcher running on its own thread.

use std::io::{BufRead, BufReader, Write};

use icaserial::errors::{ERROR_BAD_COMMAND, ERROR_PID};
use icaserial::launcher::{wire, LauncherClient};
use icaserial::process;

use super::helpers::{fifo_pair, spawn_launcher_thread};

/// A submission naming a non-existent executable yields exactly one `E`
/// frame — and the loop survives to serve the next submission.
#[tokio::test]
async fn rejected_submission_yields_err_and_loop_survives() {
    let dir = tempfile::tempdir().expect("tempdir must be created");
    let pipes = fifo_pair(dir.path(), "launcher");
    let launcher = spawn_launcher_thread(&pipes);

    let mut client = LauncherClient::connect(&pipes.request, &pipes.reply, true)
        .await
        .expect("client must connect");
    assert!(client.synchronous());

    let rejected = client
        .start_task(&["/no/such/binary".to_owned()])
        .await
        .expect("a rejection is a result, not an error");
    assert_eq!(rejected.pid, ERROR_PID, "no process may be reported");
    assert_eq!(rejected.code, ERROR_BAD_COMMAND);
    assert!(rejected.message.is_none());

    // The loop must still be serving: a valid submission goes through.
    let accepted = client
        .start_task(&["/bin/true".to_owned()])
        .await
        .expect("valid submission must run");
    assert!(accepted.pid > 0, "a real child pid must come back");
    assert_eq!(accepted.code, 0);

    drop(client);
    launcher
        .join()
        .expect("launcher thread must not panic")
        .expect("launcher must exit cleanly on client EOF");
}

/// The `C` frame carries the child's actual exit status and first stdout
/// line; later output lines are dropped.
#[tokio::test]
async fn completion_reports_exit_code_and_first_line() {
    let dir = tempfile::tempdir().expect("tempdir must be created");
    let pipes = fifo_pair(dir.path(), "launcher");
    spawn_launcher_thread(&pipes);

    let mut client = LauncherClient::connect(&pipes.request, &pipes.reply, true)
        .await
        .expect("client must connect");

    let echoed = client
        .start_task(&[
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            "echo hello; echo second".to_owned(),
        ])
        .await
        .expect("echo must run");
    assert_eq!(echoed.code, 0);
    assert_eq!(echoed.message.as_deref(), Some("hello"));

    let failed = client
        .start_task(&["/bin/sh".to_owned(), "-c".to_owned(), "exit 3".to_owned()])
        .await
        .expect("failing child must still complete");
    assert_eq!(failed.code, 3, "C frame must carry the real exit status");
    assert_eq!(failed.message.as_deref(), Some(""));
}

/// An asynchronous client returns at the `R` frame; the completion arrives
/// later on the wait channel.
#[tokio::test]
async fn async_client_returns_at_spawn_and_completes_later() {
    let dir = tempfile::tempdir().expect("tempdir must be created");
    let pipes = fifo_pair(dir.path(), "launcher");
    spawn_launcher_thread(&pipes);

    let mut client = LauncherClient::connect(&pipes.request, &pipes.reply, false)
        .await
        .expect("client must connect");
    assert!(!client.synchronous());

    let start = client
        .start_task(&[
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            "sleep 1; echo done".to_owned(),
        ])
        .await
        .expect("async start must succeed");
    assert!(start.pid > 0);
    assert_eq!(start.code, 0);
    assert!(
        start.message.is_none(),
        "async start must not carry a completion message"
    );

    let frame = client
        .next_completion_line()
        .await
        .expect("completion frame must arrive");
    let (code, output) =
        LauncherClient::parse_completion(&frame).expect("completion frame must decode");
    assert_eq!(code, 0);
    assert_eq!(output, "done");
}

/// The `R` frame arrives before the child finishes, so the client can kill
/// a long-running task early; the completion then reports the signal.
#[tokio::test]
async fn running_pid_allows_early_kill() {
    let dir = tempfile::tempdir().expect("tempdir must be created");
    let pipes = fifo_pair(dir.path(), "launcher");
    spawn_launcher_thread(&pipes);

    let mut client = LauncherClient::connect(&pipes.request, &pipes.reply, false)
        .await
        .expect("client must connect");

    let start = client
        .start_task(&["/bin/sleep".to_owned(), "30".to_owned()])
        .await
        .expect("async start must succeed");
    assert!(start.pid > 0);

    process::kill_task(start.pid).expect("kill must be delivered");

    let frame = client
        .next_completion_line()
        .await
        .expect("completion frame must arrive after the kill");
    let (code, _) =
        LauncherClient::parse_completion(&frame).expect("completion frame must decode");
    assert_eq!(code, -9, "a SIGKILLed child reports the negated signal");
}

/// Wire-level garbage is answered with `E` frames and never kills the
/// loop; a valid frame afterwards is served normally.
#[test]
fn malformed_frames_answered_with_err() {
    let dir = tempfile::tempdir().expect("tempdir must be created");
    let pipes = fifo_pair(dir.path(), "launcher");
    let launcher = spawn_launcher_thread(&pipes);

    // Raw pipe I/O, bypassing the client: open in the same order the
    // client does.
    let mut tx = std::fs::OpenOptions::new()
        .write(true)
        .open(&pipes.request)
        .expect("request pipe must open");
    let rx = std::fs::File::open(&pipes.reply).expect("reply pipe must open");
    let mut rx = BufReader::new(rx);

    let mut reply = String::new();
    for bad in ["X", "garbage line", "S{not json}"] {
        writeln!(tx, "{bad}").expect("write must succeed");
        tx.flush().expect("flush must succeed");
        reply.clear();
        rx.read_line(&mut reply).expect("reply must arrive");
        assert_eq!(
            reply.trim_end(),
            format!("E{ERROR_BAD_COMMAND}"),
            "bad frame {bad:?} must be answered with E"
        );
    }

    let frame = wire::encode_start(&["/bin/true".to_owned()]).expect("encode must succeed");
    writeln!(tx, "{frame}").expect("write must succeed");
    tx.flush().expect("flush must succeed");

    reply.clear();
    rx.read_line(&mut reply).expect("R frame must arrive");
    assert!(reply.starts_with('R'), "expected R frame, got: {reply}");
    reply.clear();
    rx.read_line(&mut reply).expect("C frame must arrive");
    assert!(reply.starts_with("C0 "), "expected C frame, got: {reply}");

    drop(tx);
    launcher
        .join()
        .expect("launcher thread must not panic")
        .expect("launcher must exit cleanly on EOF");
}
