//! Child process execution with a timeout, bounded capture and an optional tee file.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Plain-text log of both streams with truncation notices.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run `cmd` with a timeout, draining both pipes concurrently.
///
/// At most `output_limit_bytes` of each stream is kept in memory. When
/// `tee_path` is set, every stdout line is also written to that file as it
/// arrives, without the limit, so line-oriented transcripts survive in full.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, tee = tee_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee_path: Option<&Path>,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let tee = match tee_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create tee dir {}", parent.display()))?;
            }
            let file =
                File::create(path).with_context(|| format!("create tee file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Dropping the pipe at the end of the thread closes the child's stdin.
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        None => None,
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, tee));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Err(err)) if err.kind() != std::io::ErrorKind::BrokenPipe => {
                warn!(err = %err, "failed to write child stdin");
            }
            Ok(_) => {}
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
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

fn keep_within(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> usize {
    let keep = chunk.len().min(limit.saturating_sub(buf.len()));
    buf.extend_from_slice(&chunk[..keep]);
    chunk.len() - keep
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        if let Some(writer) = tee.as_mut()
            && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write tee file; disabling tee");
            tee = None;
        }
        truncated += keep_within(&mut collected, &line, limit);
    }
    Ok((collected, truncated))
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        truncated += keep_within(&mut buf, &chunk[..n], limit);
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

    #[test]
    fn captures_stdin_roundtrip_and_tees_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("out").join("transcript.jsonl");
        let output = run_command(
            sh("cat; echo done >&2"),
            Some(b"line one\nline two\n"),
            Duration::from_secs(10),
            1_000,
            Some(&tee),
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"line one\nline two\n");
        assert_eq!(output.stderr, b"done\n");
        assert_eq!(fs::read_to_string(&tee).expect("tee"), "line one\nline two\n");
    }

    #[test]
    fn truncates_capture_but_not_tee() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("full.log");
        let output = run_command(
            sh("printf 'abcdefghij\\n'"),
            None,
            Duration::from_secs(10),
            4,
            Some(&tee),
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 7);
        assert_eq!(fs::read_to_string(&tee).expect("tee"), "abcdefghij\n");
        assert!(output.render_log("agent").contains("[agent stdout truncated 7 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_command(
            sh("exec sleep 5"),
            None,
            Duration::from_millis(100),
            100,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = run_command(
            Command::new("autoloop-definitely-not-a-binary"),
            None,
            Duration::from_secs(1),
            100,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
