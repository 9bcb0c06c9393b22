//! Sandbox worker process.
//!
//! Helper-free code runs in a separate worker process holding a
//! persistent namespace: unlike a thread, a wedged worker can be killed
//! outright and replaced. The protocol is JSON lines over
//! stdin/stdout; resource caps are applied inside the worker on
//! platforms that support them.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

use super::eval::{Value, execute};
use super::guard::validate;

/// Argument that routes a process invocation into the worker loop.
pub const WORKER_ARG: &str = "sandbox-worker";

/// A command sent to the worker.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Validated sandbox code.
    pub code: String,
}

/// A worker reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerReply {
    /// `"ok"` or `"error"`.
    pub status: String,
    /// JSON form of the result value.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Display form of the result value.
    #[serde(default)]
    pub repr: Option<String>,
    /// Error message when `status == "error"`.
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerReply {
    fn ok(value: &Value) -> Self {
        Self {
            status: "ok".to_string(),
            value: Some(value.to_json()),
            repr: Some(value.repr()),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            value: None,
            repr: None,
            error: Some(message.into()),
        }
    }
}

/// Evaluates one command against the worker namespace.
#[must_use]
pub fn handle_command(command: &WorkerCommand, env: &mut HashMap<String, Value>) -> WorkerReply {
    // The parent validates before sending; validating again here keeps
    // the worker safe even against a compromised parent.
    let stmts = match validate(&command.code) {
        Ok(stmts) => stmts,
        Err(e) => return WorkerReply::err(e.to_string()),
    };
    match execute(&stmts, env, None, None) {
        Ok(value) => WorkerReply::ok(&value),
        Err(e) => WorkerReply::err(e.to_string()),
    }
}

/// Worker process entry point: applies resource caps, then serves
/// commands from stdin until EOF.
pub fn run_worker() -> std::process::ExitCode {
    apply_resource_limits();

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut env: HashMap<String, Value> = HashMap::new();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<WorkerCommand>(&line) {
            Ok(command) => handle_command(&command, &mut env),
            Err(e) => WorkerReply::err(format!("bad command: {e}")),
        };
        let Ok(encoded) = serde_json::to_string(&reply) else {
            break;
        };
        if writeln!(stdout, "{encoded}").is_err() || stdout.flush().is_err() {
            break;
        }
    }
    std::process::ExitCode::SUCCESS
}

/// Address-space, CPU and file-size caps for the worker.
#[cfg(unix)]
#[allow(unsafe_code)]
fn apply_resource_limits() {
    use libc::{RLIMIT_AS, RLIMIT_CPU, RLIMIT_FSIZE, rlimit, setrlimit};

    let caps = [
        (RLIMIT_AS, 256u64 * 1024 * 1024, 512u64 * 1024 * 1024),
        (RLIMIT_CPU, 60, 120),
        (RLIMIT_FSIZE, 10 * 1024 * 1024, 10 * 1024 * 1024),
    ];
    for (resource, soft, hard) in caps {
        let limit = rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        // Failure to tighten a limit is not fatal; the parent's timeout
        // remains the backstop.
        unsafe {
            setrlimit(resource, &raw const limit);
        }
    }
}

#[cfg(not(unix))]
fn apply_resource_limits() {}

/// Handle to a live worker process.
pub struct SandboxWorker {
    child: Child,
    stdin: ChildStdin,
    replies: Receiver<String>,
}

impl SandboxWorker {
    /// Spawns a worker running the current executable in worker mode.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Worker`] if the process cannot start.
    pub fn spawn() -> Result<Self, SandboxError> {
        let exe = std::env::current_exe().map_err(|e| SandboxError::Worker {
            reason: format!("cannot locate executable: {e}"),
        })?;
        Self::spawn_program(&exe)
    }

    /// Spawns a worker from an explicit program path.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Worker`] if the process cannot start.
    pub fn spawn_program(program: &std::path::Path) -> Result<Self, SandboxError> {
        let mut child = Command::new(program)
            .arg(WORKER_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SandboxError::Worker {
                reason: format!("spawn failed: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| SandboxError::Worker {
            reason: "worker stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::Worker {
            reason: "worker stdout unavailable".to_string(),
        })?;

        let (tx, replies) = mpsc::channel();
        std::thread::Builder::new()
            .name("sandbox-worker-reader".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| SandboxError::Worker {
                reason: format!("reader thread failed: {e}"),
            })?;

        Ok(Self {
            child,
            stdin,
            replies,
        })
    }

    /// Sends one command and waits for the reply within the timeout.
    ///
    /// # Errors
    ///
    /// [`SandboxError::Timeout`] when the reply does not arrive in time
    /// (the caller must recycle the worker), [`SandboxError::Worker`]
    /// when the process died.
    pub fn execute(&mut self, code: &str, timeout: Duration) -> Result<WorkerReply, SandboxError> {
        let command = WorkerCommand {
            code: code.to_string(),
        };
        let encoded = serde_json::to_string(&command).map_err(|e| SandboxError::Worker {
            reason: format!("encode failed: {e}"),
        })?;
        writeln!(self.stdin, "{encoded}").map_err(|e| SandboxError::Worker {
            reason: format!("worker unreachable: {e}"),
        })?;
        self.stdin.flush().map_err(|e| SandboxError::Worker {
            reason: format!("worker unreachable: {e}"),
        })?;

        match self.replies.recv_timeout(timeout) {
            Ok(line) => serde_json::from_str(&line).map_err(|e| SandboxError::Worker {
                reason: format!("bad reply: {e}"),
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SandboxError::Timeout {
                seconds: timeout.as_secs(),
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(SandboxError::Worker {
                reason: "worker exited unexpectedly".to_string(),
            }),
        }
    }

    /// Terminates the worker: kill, then reap.
    pub fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Whether the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for SandboxWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_one(code: &str, env: &mut HashMap<String, Value>) -> WorkerReply {
        handle_command(
            &WorkerCommand {
                code: code.to_string(),
            },
            env,
        )
    }

    #[test]
    fn test_handle_command_evaluates() {
        let mut env = HashMap::new();
        let reply = run_one("1 + 2", &mut env);
        assert_eq!(reply.status, "ok");
        assert_eq!(reply.value, Some(serde_json::json!(3)));
        assert_eq!(reply.repr.as_deref(), Some("3"));
    }

    #[test]
    fn test_namespace_persists_across_commands() {
        let mut env = HashMap::new();
        assert_eq!(run_one("x = 42", &mut env).status, "ok");
        let reply = run_one("x", &mut env);
        assert_eq!(reply.value, Some(serde_json::json!(42)));
    }

    #[test]
    fn test_forbidden_code_rejected_in_worker() {
        let mut env = HashMap::new();
        let reply = run_one("__import__('os')", &mut env);
        assert_eq!(reply.status, "error");
        assert!(reply.error.unwrap().contains("forbidden"));
    }

    #[test]
    fn test_runtime_error_reported() {
        let mut env = HashMap::new();
        let reply = run_one("1 / 0", &mut env);
        assert_eq!(reply.status, "error");
        assert!(reply.error.unwrap().contains("zero"));
    }

    #[test]
    fn test_reply_serde_round_trip() {
        let reply = WorkerReply::ok(&Value::Str("hi".to_string()));
        let json = serde_json::to_string(&reply).unwrap();
        let back: WorkerReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, "ok");
        assert_eq!(back.repr.as_deref(), Some("'hi'"));
    }
}
