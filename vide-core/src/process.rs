//! Subprocess lifecycle
//!
//! Owns one agent CLI subprocess: spawns it with the computed argument
//! vector, pumps framed JSON between its pipes and the protocol, and runs
//! the abort escalation ladder. Startup is idempotent: concurrent callers
//! of [`CliProcess::ensure_started`] share one in-flight start and exactly
//! one subprocess is ever spawned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::decoder::{DecodedLine, FrameDecoder};
use crate::error::{Error, Result};
use crate::response::{CODE_PARSE, CODE_PROCESS_EXIT};

const CHANNEL_CAPACITY: usize = 256;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Launch parameters for one subprocess.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub envs: HashMap<String, String>,
}

/// One agent subprocess and its pump tasks.
pub struct CliProcess {
    config: ProcessConfig,
    outbound_tx: mpsc::Sender<Value>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<Value>>>,
    incoming_tx: mpsc::Sender<Value>,
    incoming_rx: parking_lot::Mutex<Option<mpsc::Receiver<Value>>>,
    started: OnceCell<()>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    running: Arc<AtomicBool>,
    aborting: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    graceful_timeout: Duration,
    cancel: CancellationToken,
}

impl CliProcess {
    pub fn new(config: ProcessConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (exit_tx, _) = watch::channel(None);
        Self {
            config,
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            incoming_tx,
            incoming_rx: parking_lot::Mutex::new(Some(incoming_rx)),
            started: OnceCell::new(),
            child: Arc::new(tokio::sync::Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            aborting: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            exit_tx,
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    /// Sender for frames bound for the subprocess's stdin. Enqueuing is
    /// valid before startup; frames flush once the writer attaches.
    pub fn outbound_sender(&self) -> mpsc::Sender<Value> {
        self.outbound_tx.clone()
    }

    /// Take the stream of frames decoded from the subprocess's stdout.
    /// Single consumer; the protocol pump takes it once.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<Value>> {
        self.incoming_rx.lock().take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    /// Start the subprocess if it is not already starting or started.
    ///
    /// Concurrent callers share one in-flight start; exactly one
    /// subprocess is spawned across any interleaving.
    pub async fn ensure_started(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| async { self.spawn_subprocess().await })
            .await?;
        Ok(())
    }

    async fn spawn_subprocess(&self) -> Result<()> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .current_dir(&self.config.working_dir)
            .envs(&self.config.envs)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::ProcessStart(format!("{}: {}", self.config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::ProcessStart("subprocess has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessStart("subprocess has no stdout".to_string()))?;
        let stderr = child.stderr.take();

        self.running.store(true, Ordering::SeqCst);
        *self.child.lock().await = Some(child);

        // Writer: drain the outbound queue to stdin, one frame per line.
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .ok_or_else(|| Error::ProcessStart("outbound queue already taken".to_string()))?;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let mut line = frame.to_string();
                        line.push('\n');
                        if let Err(e) = stdin.write_all(line.as_bytes()).await {
                            warn!("stdin write failed: {}", e);
                            break;
                        }
                        if let Err(e) = stdin.flush().await {
                            warn!("stdin flush failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        // Reader: split stdout into frames; malformed lines surface as
        // synthetic parse-error frames and the stream continues.
        let incoming_tx = self.incoming_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 8192];
            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = stdout.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => {
                        if let Some(line) = decoder.finish() {
                            forward_line(&incoming_tx, line).await;
                        }
                        break;
                    }
                    Ok(n) => {
                        for line in decoder.push(&buf[..n]) {
                            forward_line(&incoming_tx, line).await;
                        }
                    }
                    Err(e) => {
                        warn!("stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("subprocess stderr: {}", line);
                }
            });
        }

        // Exit watcher: polls for termination and reports unexpected exits
        // as a synthetic error frame.
        let child = self.child.clone();
        let running = self.running.clone();
        let closing = self.closing.clone();
        let aborting = self.aborting.clone();
        let incoming_tx = self.incoming_tx.clone();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            loop {
                let status = {
                    let mut guard = child.lock().await;
                    match guard.as_mut() {
                        Some(child) => child.try_wait().ok().flatten(),
                        None => break,
                    }
                };
                if let Some(status) = status {
                    let code = status.code();
                    running.store(false, Ordering::SeqCst);
                    // Decide before waking exit waiters: an abort in
                    // progress clears its flag once the wait resolves.
                    let expected =
                        closing.load(Ordering::SeqCst) || aborting.load(Ordering::SeqCst);
                    let _ = exit_tx.send(Some(code));
                    if !expected {
                        let frame = json!({
                            "type": "error",
                            "error": {
                                "message": "agent process exited unexpectedly",
                                "code": CODE_PROCESS_EXIT,
                                "exit_code": code,
                            }
                        });
                        let _ = incoming_tx.send(frame).await;
                    }
                    break;
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        });

        Ok(())
    }

    /// Wait for the subprocess to exit, up to `timeout`.
    async fn wait_exit(&self, timeout: Duration) -> Option<Option<i32>> {
        let mut exited = self.exit_tx.subscribe();
        if let Some(code) = *exited.borrow() {
            return Some(code);
        }
        let wait = async {
            loop {
                if exited.changed().await.is_err() {
                    return None;
                }
                if let Some(code) = *exited.borrow() {
                    return Some(code);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Escalation ladder: wait for graceful exit, then terminate signal,
    /// then kill.
    pub async fn abort(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.aborting.store(true, Ordering::SeqCst);

        if self.wait_exit(self.graceful_timeout).await.is_none() {
            self.send_terminate_signal().await;
            if self.wait_exit(TERMINATE_TIMEOUT).await.is_none() {
                self.kill().await;
                self.wait_exit(TERMINATE_TIMEOUT).await;
            }
        }

        self.aborting.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_terminate_signal(&self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;
            let pid = {
                let guard = self.child.lock().await;
                guard.as_ref().and_then(|c| c.id())
            };
            if let Some(pid) = pid {
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("SIGTERM failed: {}", e);
                }
            }
        }
        #[cfg(not(unix))]
        {
            self.kill().await;
        }
    }

    async fn kill(&self) {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.kill().await {
                warn!("kill failed: {}", e);
            }
        }
    }

    /// Stop the pumps, wait for exit, and reap the subprocess.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        // Cancelling drops the writer and with it the subprocess's stdin,
        // which is its cue to exit.
        self.cancel.cancel();

        if self.started.get().is_some() && self.wait_exit(self.graceful_timeout).await.is_none() {
            self.kill().await;
            self.wait_exit(TERMINATE_TIMEOUT).await;
        }
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.wait().await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn forward_line(incoming_tx: &mpsc::Sender<Value>, line: DecodedLine) {
    let frame = match line {
        DecodedLine::Frame(frame) => frame,
        DecodedLine::Invalid { raw, error } => json!({
            "type": "error",
            "error": {"message": error, "code": CODE_PARSE, "details": raw}
        }),
    };
    let _ = incoming_tx.send(frame).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_process(script: &str) -> CliProcess {
        CliProcess::new(ProcessConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
            envs: HashMap::new(),
        })
        .with_graceful_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_ensure_started_spawns_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("starts");
        let process = Arc::new(script_process(&format!(
            "echo started >> {}; cat > /dev/null",
            marker.display()
        )));

        let (a, b) = tokio::join!(process.ensure_started(), process.ensure_started());
        a.unwrap();
        b.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let starts = tokio::fs::read_to_string(&marker).await.unwrap();
        assert_eq!(starts.lines().count(), 1);
        process.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_start_error() {
        let process = CliProcess::new(ProcessConfig {
            command: "/definitely/not/a/binary".to_string(),
            args: vec![],
            working_dir: std::env::temp_dir(),
            envs: HashMap::new(),
        });
        let err = process.ensure_started().await.unwrap_err();
        assert!(err.is_process_start());
    }

    #[tokio::test]
    async fn test_reader_decodes_frames() {
        let process = script_process(
            r#"printf '{"type":"system","subtype":"init"}\n'; sleep 5"#,
        );
        let mut incoming = process.take_incoming().unwrap();
        process.ensure_started().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["type"], "system");
        process.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_line_becomes_parse_error_frame() {
        let process = script_process(r#"printf 'garbage\n'; sleep 5"#);
        let mut incoming = process.take_incoming().unwrap();
        process.ensure_started().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"]["code"], CODE_PARSE);
        assert_eq!(frame["error"]["details"], "garbage");
        process.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_delivers_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("received");
        let process = script_process(&format!(
            "while IFS= read -r line; do echo \"$line\" >> {}; done",
            sink.display()
        ));
        let outbound = process.outbound_sender();

        // Enqueued before startup; flushed once the writer attaches.
        outbound.send(json!({"n": 1})).await.unwrap();
        process.ensure_started().await.unwrap();
        outbound.send(json!({"n": 2})).await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let contents = tokio::fs::read_to_string(&sink).await.unwrap_or_default();
            if contents.lines().count() == 2 {
                assert!(contents.lines().next().unwrap().contains("1"));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "frames never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        process.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_surfaces_error_frame() {
        let process = script_process("exit 3");
        let mut incoming = process.take_incoming().unwrap();
        process.ensure_started().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame["error"]["code"], CODE_PROCESS_EXIT);
        assert_eq!(frame["error"]["exit_code"], 3);
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_abort_escalates_to_kill() {
        // Traps SIGTERM so only SIGKILL can end it.
        let process = script_process("trap '' TERM; sleep 60");
        process.ensure_started().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(process.is_running());

        tokio::time::timeout(Duration::from_secs(10), process.abort())
            .await
            .unwrap()
            .unwrap();
        assert!(!process.is_running());
        assert!(!process.is_aborting());
    }

    #[tokio::test]
    async fn test_close_waits_for_exit() {
        let process = script_process("cat > /dev/null");
        process.ensure_started().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), process.close())
            .await
            .unwrap()
            .unwrap();
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_close_before_start_is_noop() {
        let process = script_process("cat");
        process.close().await.unwrap();
        assert!(!process.is_running());
    }
}
