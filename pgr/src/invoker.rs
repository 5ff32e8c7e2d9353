//! Executor invocation
//!
//! Spawns the external code-generation agent as a child process in its own
//! process group, streams stdout/stderr chunks to the caller as they
//! arrive, polls the child's resident memory once per second, and enforces
//! the per-invocation timeout with a soft-terminate / force-kill sequence.
//!
//! Invocation errors are categorized, never fatal: the loop runner turns
//! them into a synthetic status and keeps going.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::interrupt::Interrupt;

/// Grace period between SIGTERM and SIGKILL
pub const GRACEFUL_SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

/// Captured-output cap; the invocation fails cleanly beyond this
pub const OUTPUT_CAP_BYTES: usize = 64 * 1024 * 1024;

/// Callback receiving raw output chunks from the child's I/O tasks
pub type OutputFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback receiving (pid, resident KB) once per second
pub type StatsFn = Arc<dyn Fn(u32, u64) + Send + Sync>;

/// Categorized invocation failure
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to start executor '{executor}': {source}")]
    StartFailure {
        executor: String,
        #[source]
        source: std::io::Error,
    },

    #[error("executor exited with status {code}")]
    ExitNonZero { code: i32 },

    #[error("executor timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("invocation cancelled")]
    Cancelled,

    #[error("executor output exceeded {cap} bytes")]
    OutputTooLarge { cap: usize },
}

/// Per-invocation options
pub struct InvokeOptions {
    pub working_dir: PathBuf,
    pub extra_flags: Vec<String>,
    pub timeout: Duration,
    pub on_output: Option<OutputFn>,
    pub on_process_stats: Option<StatsFn>,
}

impl InvokeOptions {
    pub fn new(working_dir: &std::path::Path, timeout: Duration) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            extra_flags: Vec::new(),
            timeout,
            on_output: None,
            on_process_stats: None,
        }
    }
}

/// Captured output plus the categorized error, if any
#[derive(Debug)]
pub struct InvokeOutcome {
    /// Full captured stdout, trimmed
    pub stdout: String,
    pub error: Option<InvokeError>,
}

/// How one wait ended
enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    CapExceeded,
}

/// Configured executor binary
#[derive(Debug, Clone)]
pub struct Invoker {
    executor: String,
    base_flags: Vec<String>,
}

impl Invoker {
    pub fn new(executor: &str) -> Self {
        debug!(%executor, "Invoker::new: called");
        Self {
            executor: executor.to_string(),
            base_flags: Vec::new(),
        }
    }

    pub fn with_base_flags(mut self, flags: Vec<String>) -> Self {
        self.base_flags = flags;
        self
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    /// Run the executor with the prompt passed via `-p`
    ///
    /// The timeout is measured from entry. The returned outcome always
    /// carries whatever stdout was captured, even on error.
    pub async fn invoke(&self, interrupt: &Interrupt, prompt: &str, opts: InvokeOptions) -> InvokeOutcome {
        let deadline = tokio::time::Instant::now() + opts.timeout;
        debug!(
            executor = %self.executor,
            prompt_len = prompt.len(),
            timeout_secs = opts.timeout.as_secs(),
            working_dir = ?opts.working_dir,
            "invoke: called"
        );

        let mut cmd = tokio::process::Command::new(&self.executor);
        cmd.args(&self.base_flags)
            .args(&opts.extra_flags)
            .arg("-p")
            .arg(prompt)
            .current_dir(&opts.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group so one signal reaches the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                warn!(executor = %self.executor, error = %source, "invoke: spawn failed");
                return InvokeOutcome {
                    stdout: String::new(),
                    error: Some(InvokeError::StartFailure {
                        executor: self.executor.clone(),
                        source,
                    }),
                };
            }
        };

        let pid = child.id();
        debug!(?pid, "invoke: child spawned");

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let (cap_tx, mut cap_rx) = mpsc::channel::<()>(1);

        let stdout_task = tokio::spawn(read_stream(stdout, opts.on_output.clone(), true, Some(cap_tx)));
        let stderr_task = tokio::spawn(read_stream(stderr, opts.on_output.clone(), false, None));

        let stats_task = pid.map(|pid| {
            let on_stats = opts.on_process_stats.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Some(kb) = resident_kb(pid)
                        && let Some(cb) = &on_stats
                    {
                        cb(pid, kb);
                    }
                }
            })
        });

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => WaitOutcome::Exited(status),
                Err(e) => {
                    warn!(error = %e, "invoke: wait failed");
                    WaitOutcome::Cancelled
                }
            },
            _ = tokio::time::sleep_until(deadline) => WaitOutcome::TimedOut,
            _ = interrupt.cancelled() => WaitOutcome::Cancelled,
            _ = cap_rx.recv() => WaitOutcome::CapExceeded,
        };

        let error = match outcome {
            WaitOutcome::Exited(status) => {
                debug!(?status, "invoke: child exited");
                if status.success() {
                    None
                } else {
                    Some(InvokeError::ExitNonZero {
                        code: status.code().unwrap_or(-1),
                    })
                }
            }
            WaitOutcome::TimedOut => {
                debug!("invoke: timeout, terminating process group");
                terminate(&mut child, pid).await;
                Some(InvokeError::Timeout {
                    secs: opts.timeout.as_secs(),
                })
            }
            WaitOutcome::Cancelled => {
                debug!("invoke: cancelled, terminating process group");
                terminate(&mut child, pid).await;
                Some(InvokeError::Cancelled)
            }
            WaitOutcome::CapExceeded => {
                warn!(cap = OUTPUT_CAP_BYTES, "invoke: output cap exceeded, terminating");
                terminate(&mut child, pid).await;
                Some(InvokeError::OutputTooLarge { cap: OUTPUT_CAP_BYTES })
            }
        };

        if let Some(task) = stats_task {
            task.abort();
        }

        // Readers finish at EOF once the child is gone; don't wait forever.
        let captured = match tokio::time::timeout(Duration::from_secs(5), stdout_task).await {
            Ok(Ok(bytes)) => bytes,
            _ => {
                debug!("invoke: stdout reader did not finish cleanly");
                Vec::new()
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(5), stderr_task).await;

        let stdout = String::from_utf8_lossy(&captured).trim().to_string();
        debug!(stdout_len = stdout.len(), error = ?error, "invoke: complete");
        InvokeOutcome { stdout, error }
    }
}

/// Soft-terminate the process group, wait the grace period, then force-kill
async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            let pgid = Pid::from_raw(pid as i32);
            debug!(%pgid, "terminate: sending SIGTERM to process group");
            let _ = killpg(pgid, Signal::SIGTERM);
            tokio::time::sleep(GRACEFUL_SHUTDOWN_DELAY).await;

            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(?status, "terminate: child exited after SIGTERM");
                    return;
                }
                _ => {
                    debug!(%pgid, "terminate: child still alive, sending SIGKILL");
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        debug!("terminate: killing direct process");
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Stream a pipe to the output callback, optionally capturing bytes
///
/// Chunks are forwarded as they arrive with no line buffering; a small
/// UTF-8 carry keeps multi-byte characters intact across read boundaries.
async fn read_stream<R>(
    mut reader: R,
    on_output: Option<OutputFn>,
    capture: bool,
    cap_tx: Option<mpsc::Sender<()>>,
) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut carry: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if let Some(cb) = &on_output {
                    carry.extend_from_slice(chunk);
                    let valid = match std::str::from_utf8(&carry) {
                        Ok(s) => s.len(),
                        Err(e) => e.valid_up_to(),
                    };
                    if valid > 0 {
                        let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
                        cb(&text);
                        carry.drain(..valid);
                    }
                    // A carry that never becomes valid is garbage, not UTF-8.
                    if carry.len() > 8 {
                        carry.clear();
                    }
                }
                if capture {
                    if captured.len() + n > OUTPUT_CAP_BYTES {
                        if let Some(tx) = &cap_tx {
                            let _ = tx.try_send(());
                        }
                        return captured;
                    }
                    captured.extend_from_slice(chunk);
                }
            }
            Err(e) => {
                debug!(error = %e, "read_stream: read error");
                break;
            }
        }
    }

    if let (Some(cb), false) = (&on_output, carry.is_empty()) {
        cb(&String::from_utf8_lossy(&carry));
    }
    captured
}

/// Resident set size of a process in KB, from /proc on Linux
fn resident_kb(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                return rest.trim().trim_end_matches("kB").trim().parse().ok();
            }
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        None
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use std::time::Instant;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_invoke_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "echo hello-world");

        let invoker = Invoker::new(&script);
        let outcome = invoker
            .invoke(
                &Interrupt::new(),
                "do things",
                InvokeOptions::new(dir.path(), Duration::from_secs(10)),
            )
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.stdout, "hello-world");
    }

    #[tokio::test]
    async fn test_exit_nonzero_categorized_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "echo partial-output\nexit 3");

        let invoker = Invoker::new(&script);
        let outcome = invoker
            .invoke(
                &Interrupt::new(),
                "x",
                InvokeOptions::new(dir.path(), Duration::from_secs(10)),
            )
            .await;

        assert!(matches!(outcome.error, Some(InvokeError::ExitNonZero { code: 3 })));
        assert_eq!(outcome.stdout, "partial-output");
    }

    #[tokio::test]
    async fn test_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = Invoker::new("/definitely/not/a/binary");
        let outcome = invoker
            .invoke(
                &Interrupt::new(),
                "x",
                InvokeOptions::new(dir.path(), Duration::from_secs(10)),
            )
            .await;

        assert!(matches!(outcome.error, Some(InvokeError::StartFailure { .. })));
    }

    #[tokio::test]
    async fn test_timeout_kills_child_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "sleep 30");

        let invoker = Invoker::new(&script);
        let start = Instant::now();
        let outcome = invoker
            .invoke(
                &Interrupt::new(),
                "x",
                InvokeOptions::new(dir.path(), Duration::from_millis(200)),
            )
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(outcome.error, Some(InvokeError::Timeout { .. })));
        // Deadline plus soft/hard kill grace, with scheduler slack.
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cancel_terminates_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "sleep 30");

        let invoker = Invoker::new(&script);
        let interrupt = Interrupt::new();
        let stopper = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.stop();
        });

        let start = Instant::now();
        let outcome = invoker
            .invoke(&interrupt, "x", InvokeOptions::new(dir.path(), Duration::from_secs(30)))
            .await;

        assert!(matches!(outcome.error, Some(InvokeError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_output_streamed_through_callback() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "echo first\necho second >&2\necho third");

        let collected = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&collected);
        let on_output: OutputFn = Arc::new(move |chunk| {
            sink.lock().unwrap().push_str(chunk);
        });

        let invoker = Invoker::new(&script);
        let mut opts = InvokeOptions::new(dir.path(), Duration::from_secs(10));
        opts.on_output = Some(on_output);
        let outcome = invoker.invoke(&Interrupt::new(), "x", opts).await;

        assert!(outcome.error.is_none());
        let text = collected.lock().unwrap().clone();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        assert!(text.contains("third"));
        // stderr is forwarded but not part of captured stdout
        assert!(!outcome.stdout.contains("second"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_process_stats_polled() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "agent.sh", "sleep 2");

        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&samples);
        let on_stats: StatsFn = Arc::new(move |pid, kb| {
            sink.lock().unwrap().push((pid, kb));
        });

        let invoker = Invoker::new(&script);
        let mut opts = InvokeOptions::new(dir.path(), Duration::from_secs(10));
        opts.on_process_stats = Some(on_stats);
        let outcome = invoker.invoke(&Interrupt::new(), "x", opts).await;

        assert!(outcome.error.is_none());
        let samples = samples.lock().unwrap();
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|(_, kb)| *kb > 0));
    }
}
