//! Running child processes with timeouts and bounded output.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Which end of an oversized stream to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Head,
    Tail,
}

/// Output bounds for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct OutputLimit {
    pub bytes: usize,
    pub keep: Keep,
}

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        with_notice(&self.stdout, self.stdout_truncated)
    }

    pub fn stderr_text(&self) -> String {
        with_notice(&self.stderr, self.stderr_truncated)
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

fn with_notice(bytes: &[u8], truncated: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[truncated {truncated} bytes]\n"));
    }
    text
}

/// Owns a spawned child and kills it if dropped before being reaped, so no exit
/// path (error, panic, timeout) leaves a stray process behind.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn child(&mut self) -> Result<&mut Child> {
        self.child.as_mut().ok_or_else(|| anyhow!("child already reaped"))
    }

    fn finish(mut self, status: ExitStatus) -> ExitStatus {
        self.child = None;
        status
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. On timeout the child is killed
/// and whatever it wrote so far is still returned with `timed_out = true`.
/// Spawn failures are returned as errors; everything after spawn is an `Ok`.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    limit: OutputLimit,
) -> Result<ProcessOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let child = cmd.spawn().context("spawn command")?;
    let mut guard = ChildGuard { child: Some(child) };

    let stdout = guard
        .child()?
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = guard
        .child()?
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let mut timed_out = false;
    let status = match guard
        .child()?
        .wait_timeout(timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            let child = guard.child()?;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };
    let status = guard.finish(status);

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        debug!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: OutputLimit) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        match limit.keep {
            Keep::Head => {
                let remaining = limit.bytes.saturating_sub(buf.len());
                let keep = n.min(remaining);
                buf.extend_from_slice(&chunk[..keep]);
                truncated += n - keep;
            }
            Keep::Tail => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > limit.bytes {
                    let excess = buf.len() - limit.bytes;
                    buf.drain(..excess);
                    truncated += excess;
                }
            }
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    const LIMIT: OutputLimit = OutputLimit {
        bytes: 1_000,
        keep: Keep::Head,
    };

    #[test]
    fn captures_both_streams_and_status() {
        let out = run_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            LIMIT,
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout_text(), "out\n");
        assert_eq!(out.stderr_text(), "err\n");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn timeout_kills_and_flags() {
        let out = run_with_timeout(
            sh("echo started; exec sleep 30"),
            Duration::from_millis(300),
            LIMIT,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert_eq!(out.stdout_text(), "started\n");
    }

    #[test]
    fn tail_limit_keeps_last_bytes() {
        let out = run_with_timeout(
            sh("printf 'abcdefghij'"),
            Duration::from_secs(10),
            OutputLimit {
                bytes: 4,
                keep: Keep::Tail,
            },
        )
        .expect("run");
        assert_eq!(out.stdout, b"ghij");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_text().contains("[truncated 6 bytes]"));
    }

    #[test]
    fn head_limit_keeps_first_bytes() {
        let out = run_with_timeout(
            sh("printf 'abcdefghij'"),
            Duration::from_secs(10),
            OutputLimit {
                bytes: 3,
                keep: Keep::Head,
            },
        )
        .expect("run");
        assert_eq!(out.stdout, b"abc");
        assert_eq!(out.stdout_truncated, 7);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_with_timeout(
            Command::new("definitely-not-a-real-binary-xyz"),
            Duration::from_secs(1),
            LIMIT,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
