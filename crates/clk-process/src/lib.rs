//! Process actuation: locating the provider CLI, spawning it, and streaming
//! merged stdout+stderr to the caller's writer while capturing it for
//! classification.
//!
//! The parent environment is never mutated; each child gets its own copy with
//! an augmented PATH (see [`ChildConfig`]).

pub mod cli_path;
pub mod dispatch;

pub use cli_path::resolve_binary;
pub use dispatch::{build_argv, redacted_display, region_for};

use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared live-progress sink. CLI output is streamed here line by line so a
/// user can follow a long apply.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Write one line to the shared writer, swallowing I/O errors (a broken
/// progress pipe must not fail the run).
pub fn emit(writer: &SharedWriter, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{line}");
    }
}

/// A writer that discards everything. Useful for callers that only want the
/// final result.
pub fn null_writer() -> SharedWriter {
    Arc::new(Mutex::new(std::io::sink()))
}

/// Result of one CLI invocation: the merged stdout+stderr stream and the
/// process exit code (1 when signal-killed).
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub merged: String,
    pub exit_code: i32,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Per-child process configuration. Built once per run and passed by value;
/// the parent's environment is left untouched.
#[derive(Debug, Clone, Default)]
pub struct ChildConfig {
    /// Explicit binary path, bypassing resolution.
    pub binary_override: Option<PathBuf>,
    /// Directories appended to the child's PATH copy.
    pub extra_path: Vec<PathBuf>,
    /// Extra environment forwarded to the child (e.g. Cloudflare tokens).
    pub forward_env: Vec<(String, String)>,
}

impl ChildConfig {
    /// Child PATH: the parent's value plus `extra_path` entries.
    fn child_path(&self) -> Option<std::ffi::OsString> {
        if self.extra_path.is_empty() {
            return None;
        }
        let base = std::env::var_os("PATH").unwrap_or_default();
        let mut parts: Vec<PathBuf> = std::env::split_paths(&base).collect();
        for dir in &self.extra_path {
            if !parts.contains(dir) {
                parts.push(dir.clone());
            }
        }
        std::env::join_paths(parts).ok()
    }
}

const READ_BUF_SIZE: usize = 4096;

/// Spawn `binary argv...` and capture merged stdout+stderr, streaming each
/// complete line to `writer` as it arrives. Honors `cancel`: the child's
/// process group is killed and the call returns with whatever was captured
/// plus exit code 130.
pub async fn run_streamed(
    binary: &std::path::Path,
    argv: &[String],
    stdin_data: Option<Vec<u8>>,
    config: &ChildConfig,
    writer: &SharedWriter,
    cancel: &CancellationToken,
) -> Result<CliOutput> {
    let mut cmd = Command::new(binary);
    cmd.args(argv);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    if stdin_data.is_some() {
        cmd.stdin(std::process::Stdio::piped());
    } else {
        cmd.stdin(std::process::Stdio::null());
    }
    cmd.kill_on_drop(true);
    if let Some(path) = config.child_path() {
        cmd.env("PATH", path);
    }
    for (key, value) in &config.forward_env {
        cmd.env(key, value);
    }

    // Isolate the child in its own process group so cancellation can kill the
    // whole tree. SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", binary.display()))?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    warn!("stdin write error: {e}");
                }
                let _ = stdin.shutdown().await;
            });
        }
    }

    let stdout = child.stdout.take().context("failed to capture stdout")?;
    let stderr = child.stderr.take().context("failed to capture stderr")?;
    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);

    let mut merged = String::new();
    let mut line_buf = String::new();
    let mut stdout_buf = [0u8; READ_BUF_SIZE];
    let mut stderr_buf = [0u8; READ_BUF_SIZE];
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut cancelled = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            result = stdout_reader.read(&mut stdout_buf), if !stdout_done => {
                match result {
                    Ok(0) | Err(_) => stdout_done = true,
                    Ok(n) => accumulate(&stdout_buf[..n], &mut line_buf, &mut merged, writer),
                }
            }
            result = stderr_reader.read(&mut stderr_buf), if !stderr_done => {
                match result {
                    Ok(0) | Err(_) => stderr_done = true,
                    Ok(n) => accumulate(&stderr_buf[..n], &mut line_buf, &mut merged, writer),
                }
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                debug!("cancellation requested; killing child process group");
                kill_child_process_group(&mut child);
                break;
            }
        }
    }

    if !line_buf.is_empty() {
        emit(writer, line_buf.trim_end_matches('\n'));
        merged.push_str(&line_buf);
        line_buf.clear();
    }

    let status = child.wait().await.context("failed to wait for child")?;
    let exit_code = if cancelled {
        130
    } else {
        status.code().unwrap_or_else(|| {
            warn!("process terminated by signal, using exit code 1");
            1
        })
    };

    Ok(CliOutput { merged, exit_code })
}

/// Append a chunk to the line buffer, flushing complete lines to the merged
/// capture and the live writer.
fn accumulate(chunk: &[u8], line_buf: &mut String, merged: &mut String, writer: &SharedWriter) {
    line_buf.push_str(&String::from_utf8_lossy(chunk));
    while let Some(newline_pos) = line_buf.find('\n') {
        let line: String = line_buf.drain(..=newline_pos).collect();
        emit(writer, line.trim_end_matches('\n'));
        merged.push_str(&line);
    }
}

fn kill_child_process_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; negative PID targets the group.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            return;
        }
    }

    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_writer() -> (SharedWriter, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        struct VecWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for VecWriter {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        (Arc::new(Mutex::new(VecWriter(buf.clone()))), buf)
    }

    #[tokio::test]
    async fn captures_merged_output_and_exit_code() {
        let (writer, buf) = capture_writer();
        let cancel = CancellationToken::new();
        let out = run_streamed(
            std::path::Path::new("/bin/sh"),
            &["-c".to_string(), "echo out; echo err 1>&2; exit 3".to_string()],
            None,
            &ChildConfig::default(),
            &writer,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(out.exit_code, 3);
        assert!(out.merged.contains("out"));
        assert!(out.merged.contains("err"));
        let streamed = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(streamed.contains("out"));
        assert!(streamed.contains("err"));
    }

    #[tokio::test]
    async fn stdin_data_reaches_child() {
        let (writer, _) = capture_writer();
        let cancel = CancellationToken::new();
        let out = run_streamed(
            std::path::Path::new("/bin/cat"),
            &[],
            Some(b"hello from stdin".to_vec()),
            &ChildConfig::default(),
            &writer,
            &cancel,
        )
        .await
        .unwrap();
        assert!(out.success());
        assert!(out.merged.contains("hello from stdin"));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let (writer, _) = capture_writer();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });
        let started = std::time::Instant::now();
        let out = run_streamed(
            std::path::Path::new("/bin/sh"),
            &["-c".to_string(), "sleep 60".to_string()],
            None,
            &ChildConfig::default(),
            &writer,
            &cancel,
        )
        .await
        .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(out.exit_code, 130);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let (writer, _) = capture_writer();
        let cancel = CancellationToken::new();
        let result = run_streamed(
            std::path::Path::new("/definitely/not/a/binary"),
            &[],
            None,
            &ChildConfig::default(),
            &writer,
            &cancel,
        )
        .await;
        assert!(result.is_err());
    }
}
