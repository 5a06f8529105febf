//! Child-process seam.
//!
//! All mount, unmount and diff invocations go through [`ProcessRunner`] so
//! the overlay logic can be exercised against a fake in tests.
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{OverlayError, Result};
use crate::logging::LogConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the child was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub const fn success(&self) -> bool {
        matches!(self.status, Some(0))
    }
}

pub trait ProcessRunner: Send + Sync {
    /// Run `argv` to completion. Only spawn failures and timeouts are
    /// errors; a non-zero exit is reported through [`ProcessOutput::status`].
    fn run(&self, argv: &[String], timeout: Duration) -> Result<ProcessOutput>;
}

/// Shell-style rendering for log lines and error messages.
pub fn display_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("'{arg}'")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs real commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner {
    log: LogConfig,
}

impl SystemRunner {
    pub const fn new(log: LogConfig) -> Self {
        Self { log }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                tracing::debug!("failed to read child output: {e}");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Collect a drained pipe, giving up at `deadline`. A grandchild that
/// inherited the pipe keeps it open after the child itself exits.
fn join_output(handle: JoinHandle<String>, deadline: Instant) -> Option<String> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Some(handle.join().unwrap_or_default())
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> std::io::Result<Option<Option<i32>>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code()));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl ProcessRunner for SystemRunner {
    #[tracing::instrument(level = "trace", skip(self))]
    fn run(&self, argv: &[String], timeout: Duration) -> Result<ProcessOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(OverlayError::Configuration("empty command line".to_owned()));
        };
        let rendered = display_argv(argv);
        self.log.op(format_args!("exec: {rendered}"));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OverlayError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let waited = wait_with_deadline(&mut child, deadline).map_err(|source| OverlayError::Spawn {
            program: program.clone(),
            source,
        })?;

        let Some(status) = waited else {
            tracing::warn!("killing `{rendered}` after {}s", timeout.as_secs());
            if let Err(e) = child.kill() {
                tracing::debug!("kill failed: {e}");
            }
            if let Err(e) = child.wait() {
                tracing::debug!("reaping killed child failed: {e}");
            }
            return Err(OverlayError::Timeout {
                command: rendered,
                timeout,
            });
        };

        let (Some(stdout), Some(stderr)) = (join_output(stdout, deadline), join_output(stderr, deadline)) else {
            tracing::warn!("output of `{rendered}` still open after {}s", timeout.as_secs());
            return Err(OverlayError::Timeout {
                command: rendered,
                timeout,
            });
        };

        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
        })
    }
}
