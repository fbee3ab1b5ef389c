use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exit status reported when the executable could not be started or observed.
pub const SPAWN_FAILED_STATUS: i32 = -1;

pub type ProcessRunner =
    Arc<dyn Fn(&str, &[String], Duration) -> ProcessExecutionResult + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExecutionResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessExecutionResult {
    #[cfg(test)]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: SPAWN_FAILED_STATUS,
            stdout: String::new(),
            stderr: "timed out".to_string(),
            timed_out: true,
        }
    }
}

/// Runs `executable` to completion or until `timeout` elapses, whichever comes
/// first. A process still running at the deadline is killed and reaped.
pub fn default_process_runner(
    executable: &str,
    arguments: &[String],
    timeout: Duration,
) -> ProcessExecutionResult {
    let mut child = match Command::new(executable)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => return ProcessExecutionResult::failure(SPAWN_FAILED_STATUS, err.to_string()),
    };

    let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
    let stderr_reader = child.stderr.take().map(spawn_pipe_reader);

    let deadline = Instant::now() + timeout;
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return ProcessExecutionResult::failure(SPAWN_FAILED_STATUS, err.to_string());
            }
        }
    };

    let stdout = stdout_reader.map(join_pipe_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_pipe_reader).unwrap_or_default();

    match exit_status {
        Some(status) => ProcessExecutionResult {
            status: status.code().unwrap_or(SPAWN_FAILED_STATUS),
            stdout,
            stderr,
            timed_out: false,
        },
        None => ProcessExecutionResult {
            stdout,
            stderr,
            ..ProcessExecutionResult::timeout()
        },
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_pipe_reader(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let result = default_process_runner(
            "/bin/sh",
            &["-c".to_string(), "printf hello; exit 3".to_string()],
            Duration::from_secs(5),
        );
        assert_eq!(result.status, 3);
        assert_eq!(result.stdout, "hello");
        assert!(!result.timed_out);
    }

    #[test]
    fn kills_process_that_outlives_timeout() {
        let started = Instant::now();
        let result = default_process_runner(
            "/bin/sh",
            &["-c".to_string(), "exec sleep 10".to_string()],
            Duration::from_millis(200),
        );
        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn reports_spawn_failure_as_status() {
        let result = default_process_runner(
            "/nonexistent/cxauth-test-binary",
            &[],
            Duration::from_secs(1),
        );
        assert_eq!(result.status, SPAWN_FAILED_STATUS);
        assert!(!result.timed_out);
    }
}
