//! End-to-end tests of the Node over real FIFOs.
//!
//! A scripted engine runs inside the test process: it reads command frames
//! from the commands FIFO and writes whatever the script returns to the
//! results FIFO.

#![cfg(target_os = "linux")]

use gateway_core::{ensure_fifo, Command, CommandResult, GatewayError, Node, NodeSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A command frame as seen by the engine.
#[derive(Debug, Clone)]
struct Frame {
    id: Uuid,
    tokens: Vec<String>,
}

fn parse_frame(line: &str) -> Frame {
    let mut fields = line.trim_end_matches('\n').split('\t');
    let id = Uuid::parse_str(fields.next().unwrap()).unwrap();
    Frame {
        id,
        tokens: fields.map(str::to_string).collect(),
    }
}

fn reply(id: Uuid, code: i32, tokens: &[&str]) -> Vec<u8> {
    CommandResult::new(id, code, tokens.iter().map(|t| t.to_string()).collect()).encode()
}

/// Scripted engine: every received frame is passed to `script`, which returns
/// the raw bytes to write back (possibly nothing).
fn spawn_engine<F>(dir: &Path, script: F) -> JoinHandle<()>
where
    F: FnMut(Frame) -> Vec<u8> + Send + 'static,
{
    let commands = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(dir.join("commands.fifo"))
        .unwrap();
    let results = pipe::OpenOptions::new()
        .read_write(true)
        .open_sender(dir.join("results.fifo"))
        .unwrap();

    tokio::spawn(run_engine(commands, results, script))
}

async fn run_engine<F>(commands: pipe::Receiver, mut results: pipe::Sender, mut script: F)
where
    F: FnMut(Frame) -> Vec<u8> + Send + 'static,
{
    let mut lines = BufReader::new(commands).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let out = script(parse_frame(&line));
        if !out.is_empty() {
            results.write_all(&out).await.unwrap();
        }
    }
}

fn node_settings(dir: &Path) -> NodeSettings {
    let commands = dir.join("commands.fifo");
    let results = dir.join("results.fifo");
    ensure_fifo(&commands).unwrap();
    ensure_fifo(&results).unwrap();

    let mut settings = NodeSettings::new(commands, results);
    settings.settle_delay_ms = 100;
    settings.open_retry_attempts = 2;
    settings.open_retry_delay_ms = 50;
    settings.eof_poll_interval_ms = 10;
    settings
}

async fn connected_node<F>(temp_dir: &TempDir, script: F) -> (Arc<Node>, JoinHandle<()>)
where
    F: FnMut(Frame) -> Vec<u8> + Send + 'static,
{
    let settings = node_settings(temp_dir.path());
    let engine = spawn_engine(temp_dir.path(), script);
    let node = Arc::new(Node::new(settings));
    node.start_communication().await.unwrap();
    assert!(node.is_communicating());
    (node, engine)
}

#[tokio::test]
async fn test_equivalents_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let (node, engine) = connected_node(&temp_dir, |frame| {
        assert_eq!(frame.tokens, vec!["GET:equivalents"]);
        reply(frame.id, 200, &["2", "USD", "EUR"])
    })
    .await;

    let cmd = Command::new(["GET:equivalents"]);
    let result = node.execute(&cmd, Duration::from_secs(5)).await.unwrap();

    assert_eq!(result.id, cmd.id());
    assert_eq!(result.code, 200);
    assert_eq!(result.tokens, vec!["2", "USD", "EUR"]);
    assert_eq!(node.pending(), 0);

    node.stop_communication().await;
    engine.abort();
}

#[tokio::test]
async fn test_concurrent_commands_answered_in_reverse() {
    const CALLERS: usize = 16;

    let temp_dir = TempDir::new().unwrap();
    let mut held = Vec::new();
    let (node, engine) = connected_node(&temp_dir, move |frame| {
        // Hold every frame until all have arrived, then answer backwards.
        held.push(frame);
        if held.len() < CALLERS {
            return Vec::new();
        }
        held.drain(..)
            .rev()
            .flat_map(|frame| {
                let echo = frame.tokens[1].clone();
                reply(frame.id, 200, &[echo.as_str()])
            })
            .collect()
    })
    .await;

    let callers: Vec<_> = (0..CALLERS)
        .map(|i| {
            let node = node.clone();
            tokio::spawn(async move {
                let cmd = Command::new(["ECHO".to_string(), i.to_string()]);
                let result = node.execute(&cmd, Duration::from_secs(10)).await.unwrap();
                assert_eq!(result.id, cmd.id());
                assert_eq!(result.tokens, vec![i.to_string()]);
            })
        })
        .collect();

    for caller in callers {
        caller.await.unwrap();
    }
    assert_eq!(node.pending(), 0);

    node.stop_communication().await;
    engine.abort();
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let (late_tx, mut late_rx) = mpsc::unbounded_channel::<Uuid>();
    let (node, engine) = connected_node(&temp_dir, move |frame| {
        if frame.tokens == ["SLOW"] {
            // Answer later, from the test body.
            late_tx.send(frame.id).unwrap();
            Vec::new()
        } else {
            reply(frame.id, 200, &["fast"])
        }
    })
    .await;

    let slow = Command::new(["SLOW"]);
    let err = node
        .execute(&slow, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ResultTimeout { .. }));
    assert_eq!(node.pending(), 0);

    // Inject the late reply on a second writer, then keep going.
    let slow_id = late_rx.recv().await.unwrap();
    let mut writer = pipe::OpenOptions::new()
        .open_sender(temp_dir.path().join("results.fifo"))
        .unwrap();
    writer.write_all(&reply(slow_id, 200, &["late"])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.pending(), 0);

    let fast = Command::new(["FAST"]);
    let result = node.execute(&fast, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.tokens, vec!["fast"]);
    assert_eq!(node.pending(), 0);

    node.stop_communication().await;
    engine.abort();
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let (node, engine) = connected_node(&temp_dir, |frame| {
        let mut out = Vec::new();
        out.extend_from_slice(b"\n");
        out.extend_from_slice(b"garbage\n");
        out.extend_from_slice(b"zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz\t200\n");
        out.extend_from_slice(format!("{}\tNaN\n", frame.id).as_bytes());
        out.extend_from_slice(&reply(frame.id, 201, &["ok"]));
        out
    })
    .await;

    let cmd = Command::new(["PING"]);
    let result = node.execute(&cmd, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.code, 201);
    assert_eq!(result.tokens, vec!["ok"]);

    node.stop_communication().await;
    engine.abort();
}

#[tokio::test]
async fn test_get_result_without_send() {
    let temp_dir = TempDir::new().unwrap();
    let (node, engine) = connected_node(&temp_dir, |frame| reply(frame.id, 200, &[])).await;

    let err = node
        .get_result(&Command::new(["NEVER-SENT"]), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownCommand { .. }));

    node.stop_communication().await;
    engine.abort();
}

#[tokio::test]
async fn test_resumable_replies_with_rearm() {
    let temp_dir = TempDir::new().unwrap();
    let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<Uuid>();
    let (node, engine) = connected_node(&temp_dir, move |frame| {
        sent_tx.send(frame.id).unwrap();
        reply(frame.id, 200, &["1"])
    })
    .await;

    let cmd = Command::resumable(["GET:contractors/transactions/max"]);
    let collector = {
        let node = node.clone();
        let cmd = cmd.clone();
        tokio::spawn(async move { node.collect_resumable(&cmd, Duration::from_secs(5)).await })
    };

    // The first reply comes from the script. Give the collector time to
    // take it and re-arm, then push the terminal reply by hand.
    let id = sent_rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.pending(), 1);
    let mut writer = pipe::OpenOptions::new()
        .open_sender(temp_dir.path().join("results.fifo"))
        .unwrap();
    writer.write_all(&reply(id, 10, &[])).await.unwrap();

    let replies = collector.await.unwrap().unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].code, 200);
    assert_eq!(replies[1].code, 10);
    assert_eq!(node.pending(), 0);

    node.stop_communication().await;
    engine.abort();
}

#[tokio::test]
async fn test_stop_and_restart_communication() {
    let temp_dir = TempDir::new().unwrap();
    let (node, engine) = connected_node(&temp_dir, |frame| reply(frame.id, 200, &[])).await;

    node.stop_communication().await;
    assert!(!node.is_communicating());

    node.start_communication().await.unwrap();
    assert!(node.is_communicating());

    let result = node
        .execute(&Command::new(["PING"]), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.code, 200);

    node.stop_communication().await;
    engine.abort();
}

/// Drop the engine's ends of both FIFOs, as if the process died.
async fn kill_engine(engine: JoinHandle<()>) {
    engine.abort();
    let _ = engine.await;
}

fn pong(frame: Frame) -> Vec<u8> {
    reply(frame.id, 200, &["pong"])
}

#[tokio::test]
async fn test_write_failure_answers_caller_then_recovers() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = node_settings(temp_dir.path());
    settings.open_retry_attempts = 100;
    settings.write_failure_pause_ms = 10;

    let engine = spawn_engine(temp_dir.path(), pong);
    let node = Node::new(settings);
    node.start_communication().await.unwrap();
    kill_engine(engine).await;

    let cmd = Command::new(["PING"]);
    let started = std::time::Instant::now();
    let err = node.execute(&cmd, Duration::from_secs(5)).await.unwrap_err();
    match err {
        GatewayError::FifoWrite { id, .. } => assert_eq!(id, cmd.id()),
        other => panic!("Expected FifoWrite, got: {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(node.pending(), 0);

    // A reader comes back while the outbound task is still reopening.
    let engine = spawn_engine(temp_dir.path(), pong);
    let result = node
        .execute(&Command::new(["PING"]), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.tokens, vec!["pong"]);
    assert!(node.is_communicating());

    node.stop_communication().await;
    engine.abort();
}

#[tokio::test]
async fn test_start_replaces_failed_session() {
    let temp_dir = TempDir::new().unwrap();
    let mut settings = node_settings(temp_dir.path());
    settings.write_failure_pause_ms = 10;

    let engine = spawn_engine(temp_dir.path(), pong);
    let node = Node::new(settings);
    node.start_communication().await.unwrap();
    kill_engine(engine).await;

    let err = node
        .execute(&Command::new(["PING"]), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::FifoWrite { .. }));

    // With no reader the outbound task gives up reopening, which is fatal.
    tokio::time::timeout(Duration::from_secs(5), async {
        while node.is_communicating() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("outbound failure was not reported");

    let engine = spawn_engine(temp_dir.path(), pong);
    node.start_communication().await.unwrap();
    assert!(node.is_communicating());

    let result = node
        .execute(&Command::new(["PING"]), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.tokens, vec!["pong"]);

    node.stop_communication().await;
    engine.abort();
}
