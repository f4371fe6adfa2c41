//! External process seam: spawn a command, stream its stdout, kill it, read
//! its exit code.
//!
//! [`TokioSpawner`] runs real processes. [`ScriptedSpawner`] replays canned
//! output so runner and scheduler tests never start a real agent.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Barrier, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Bytes read from a child's stdout per chunk.
const READ_BUF_SIZE: usize = 8 * 1024;

/// How long a killed process's stderr may keep draining. Grandchildren that
/// inherited the pipe can hold it open long after the kill.
const STDERR_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program and arguments joined by spaces, for logs and matching.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A running process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Next stdout chunk, `None` at end of stream.
    async fn next_chunk(&mut self) -> Option<io::Result<String>>;

    /// Wait for exit. Processes ended by a signal report `-1`.
    async fn wait(&mut self) -> io::Result<i32>;

    /// Best-effort force kill.
    async fn kill(&mut self) -> io::Result<()>;

    /// Collected stderr. Complete only after [`wait`](Self::wait).
    async fn stderr(&mut self) -> String;
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn ProcessHandle>>;
}

// ---------------------------------------------------------------------------
// TokioSpawner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn ProcessHandle>> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        debug!(pid = ?child.id(), command = %request.command_line(), "spawned process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout not piped"))?;
        let stderr_bytes = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = child.stderr.take().map(|mut stderr| {
            let sink = Arc::clone(&stderr_bytes);
            tokio::spawn(async move {
                let mut buf = [0u8; READ_BUF_SIZE];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    sink.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .extend_from_slice(&buf[..n]);
                }
            })
        });

        Ok(Box::new(TokioProcess {
            child,
            stdout,
            carry: Vec::new(),
            stderr_task,
            stderr_bytes,
            killed: false,
        }))
    }
}

struct TokioProcess {
    child: Child,
    stdout: ChildStdout,
    /// Bytes of a UTF-8 sequence split across reads.
    carry: Vec<u8>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_bytes: Arc<Mutex<Vec<u8>>>,
    killed: bool,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    async fn next_chunk(&mut self) -> Option<io::Result<String>> {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match self.stdout.read(&mut buf).await {
                Ok(0) if self.carry.is_empty() => return None,
                Ok(0) => {
                    let rest = std::mem::take(&mut self.carry);
                    return Some(Ok(String::from_utf8_lossy(&rest).into_owned()));
                }
                Ok(n) => {
                    self.carry.extend_from_slice(&buf[..n]);
                    let text = take_decoded(&mut self.carry);
                    if !text.is_empty() {
                        return Some(Ok(text));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed = true;
        self.child.kill().await
    }

    async fn stderr(&mut self) -> String {
        if let Some(mut task) = self.stderr_task.take() {
            if !self.killed {
                let _ = (&mut task).await;
            } else if tokio::time::timeout(STDERR_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        let bytes = self.stderr_bytes.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Decode everything in `bytes` except a trailing incomplete UTF-8
/// sequence, which stays behind for the next read. Invalid bytes become
/// U+FFFD.
fn take_decoded(bytes: &mut Vec<u8>) -> String {
    let ready_len = bytes.len() - incomplete_tail(bytes);
    let ready: Vec<u8> = bytes.drain(..ready_len).collect();
    String::from_utf8_lossy(&ready).into_owned()
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if back < width { back } else { 0 };
    }
    0
}

// ---------------------------------------------------------------------------
// ScriptedSpawner
// ---------------------------------------------------------------------------

/// Canned behaviour for one scripted process.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProcess {
    pub chunks: Vec<String>,
    pub chunk_delay: Duration,
    pub exit_code: i32,
    pub stderr: String,
    /// Keep stdout open after the last chunk until killed.
    pub hang: bool,
    /// Wait on this barrier before emitting the first chunk.
    pub gate: Option<Arc<Barrier>>,
    /// Read error raised after the last chunk.
    pub stream_error: Option<String>,
}

impl ScriptedProcess {
    pub fn output<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn failing(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn gated(mut self, gate: Arc<Barrier>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fail the stdout read once the chunks run out.
    pub fn then_read_error(mut self, message: impl Into<String>) -> Self {
        self.stream_error = Some(message.into());
        self
    }
}

/// Test double: picks a [`ScriptedProcess`] by substring of the command line.
///
/// Each matcher holds a queue; the last entry repeats once the others are used.
#[derive(Default)]
pub struct ScriptedSpawner {
    scripts: Mutex<Vec<(String, VecDeque<ScriptedProcess>)>>,
    fallback: Mutex<Option<ScriptedProcess>>,
    spawned: Mutex<Vec<SpawnRequest>>,
    kills: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for any command line containing `needle`.
    pub fn on(self, needle: impl Into<String>, process: ScriptedProcess) -> Self {
        let needle = needle.into();
        {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            match scripts.iter_mut().find(|(n, _)| *n == needle) {
                Some((_, queue)) => queue.push_back(process),
                None => scripts.push((needle, VecDeque::from([process]))),
            }
        }
        self
    }

    /// Script used when nothing else matches.
    pub fn fallback(self, process: ScriptedProcess) -> Self {
        *self.fallback.lock().unwrap_or_else(|e| e.into_inner()) = Some(process);
        self
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Highest number of scripted processes alive at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn pick(&self, request: &SpawnRequest) -> Option<ScriptedProcess> {
        let line = request.command_line();
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, queue)) = scripts.iter_mut().find(|(n, _)| line.contains(n.as_str())) {
            return if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
        }
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProcessSpawner for ScriptedSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn ProcessHandle>> {
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let script = self.pick(request).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no script for `{}`", request.command_line()),
            )
        })?;

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        Ok(Box::new(ScriptedHandle {
            chunks: script.chunks.into_iter().collect(),
            delay: script.chunk_delay,
            exit_code: script.exit_code,
            stderr: script.stderr,
            hang: script.hang,
            gate: script.gate,
            stream_error: script.stream_error,
            killed: Arc::new(AtomicBool::new(false)),
            kill_notify: Arc::new(Notify::new()),
            kills: Arc::clone(&self.kills),
            running: Arc::clone(&self.running),
            finished: false,
        }))
    }
}

struct ScriptedHandle {
    chunks: VecDeque<String>,
    delay: Duration,
    exit_code: i32,
    stderr: String,
    hang: bool,
    gate: Option<Arc<Barrier>>,
    stream_error: Option<String>,
    killed: Arc<AtomicBool>,
    kill_notify: Arc<Notify>,
    kills: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    finished: bool,
}

impl ScriptedHandle {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl ProcessHandle for ScriptedHandle {
    async fn next_chunk(&mut self) -> Option<io::Result<String>> {
        if let Some(gate) = self.gate.take() {
            gate.wait().await;
        }
        if self.killed.load(Ordering::SeqCst) {
            return None;
        }
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.kill_notify.notified() => return None,
            }
        }
        match self.chunks.pop_front() {
            Some(chunk) => Some(Ok(chunk)),
            None if self.stream_error.is_some() => self
                .stream_error
                .take()
                .map(|message| Err(io::Error::new(io::ErrorKind::Other, message))),
            None if self.hang => {
                self.kill_notify.notified().await;
                None
            }
            None => None,
        }
    }

    async fn wait(&mut self) -> io::Result<i32> {
        self.finish();
        if self.killed.load(Ordering::SeqCst) {
            Ok(-1)
        } else {
            Ok(self.exit_code)
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.kill_notify.notify_one();
        }
        self.finish();
        Ok(())
    }

    async fn stderr(&mut self) -> String {
        self.stderr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_process_replays_chunks() {
        let spawner = ScriptedSpawner::new().on("hello", ScriptedProcess::output(["a", "b"]));
        let mut handle = spawner
            .spawn(&SpawnRequest::new("echo").args(["hello"]))
            .await
            .unwrap();
        assert_eq!(handle.next_chunk().await.unwrap().unwrap(), "a");
        assert_eq!(handle.next_chunk().await.unwrap().unwrap(), "b");
        assert!(handle.next_chunk().await.is_none());
        assert_eq!(handle.wait().await.unwrap(), 0);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn queued_scripts_are_consumed_then_last_repeats() {
        let spawner = ScriptedSpawner::new()
            .on("x", ScriptedProcess::failing(1, "boom"))
            .on("x", ScriptedProcess::output(["ok"]));
        let req = SpawnRequest::new("x");
        for expected in [1, 0, 0] {
            let mut h = spawner.spawn(&req).await.unwrap();
            while h.next_chunk().await.is_some() {}
            assert_eq!(h.wait().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn unmatched_command_fails_to_spawn() {
        let spawner = ScriptedSpawner::new();
        let err = spawner.spawn(&SpawnRequest::new("nope")).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn kill_ends_a_hanging_process() {
        let spawner = ScriptedSpawner::new().fallback(ScriptedProcess::output(["x"]).hanging());
        let mut h = spawner.spawn(&SpawnRequest::new("agent")).await.unwrap();
        assert!(h.next_chunk().await.is_some());
        h.kill().await.unwrap();
        assert!(h.next_chunk().await.is_none());
        assert_eq!(h.wait().await.unwrap(), -1);
        assert_eq!(spawner.kill_count(), 1);
    }

    #[test]
    fn split_multibyte_sequence_waits_for_the_rest() {
        // "é" is C3 A9.
        let mut bytes = b"caf\xC3".to_vec();
        assert_eq!(take_decoded(&mut bytes), "caf");
        assert_eq!(bytes, vec![0xC3]);
        bytes.push(0xA9);
        assert_eq!(take_decoded(&mut bytes), "é");
        assert!(bytes.is_empty());
    }

    #[test]
    fn invalid_bytes_decode_lossily() {
        let mut bytes = b"ok \xFF done".to_vec();
        assert_eq!(take_decoded(&mut bytes), "ok \u{FFFD} done");
        assert!(bytes.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_spawner_delivers_output_without_newline() {
        let mut h = TokioSpawner
            .spawn(&SpawnRequest::new("sh").args(["-c", "printf 'no newline'; sleep 5"]))
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), h.next_chunk())
            .await
            .expect("chunk arrives before the newline")
            .unwrap()
            .unwrap();
        assert_eq!(first, "no newline");
        h.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_spawner_streams_output() {
        let mut h = TokioSpawner
            .spawn(&SpawnRequest::new("sh").args(["-c", "echo one; echo two; echo err >&2; exit 3"]))
            .await
            .unwrap();
        let mut out = String::new();
        while let Some(chunk) = h.next_chunk().await {
            out.push_str(&chunk.unwrap());
        }
        assert_eq!(out, "one\ntwo\n");
        assert_eq!(h.wait().await.unwrap(), 3);
        assert_eq!(h.stderr().await.trim(), "err");
    }
}
