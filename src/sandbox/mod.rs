//! Sandboxed evaluation of untrusted REPL code.
//!
//! Defence in depth: a length pre-filter, a forbidden-pattern regex
//! scan, a structural allow-list over the sandbox's own expression AST,
//! and an attribute post-filter, all before execution. Execution then
//! happens in one of two venues:
//!
//! - **Worker process** (helper-free code): a killable subprocess with a
//!   persistent namespace and resource caps. Timeouts terminate and
//!   replace the worker.
//! - **Calling thread** (code referencing helpers): helpers need the
//!   state manager, so this path stays in-process and relies on the
//!   evaluator's cooperative deadline.

pub mod ast;
pub mod eval;
pub mod guard;
pub mod helpers;
pub mod worker;

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::core::constants::DEFAULT_EXEC_TIMEOUT;
use crate::error::{Result, SandboxError};

pub use eval::{SAFE_BUILTINS, Value};
pub use guard::validate;
pub use helpers::{HELPER_NAMES, HelperDispatcher, HelperRequest, references_helpers};
pub use worker::{SandboxWorker, WORKER_ARG, run_worker};

/// Outcome of a sandbox execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    /// JSON form of the result value.
    pub value: serde_json::Value,
    /// Display form of the result value.
    pub repr: String,
}

/// Session-scoped sandbox executor.
///
/// Owns the worker process (restarted on timeout) and the in-process
/// namespace used by the helper execution path.
pub struct SandboxExecutor {
    timeout: Duration,
    worker: Option<SandboxWorker>,
    worker_program: Option<std::path::PathBuf>,
    thread_env: HashMap<String, Value>,
}

impl SandboxExecutor {
    /// Creates an executor with the given timeout in seconds.
    #[must_use]
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            worker: None,
            worker_program: None,
            thread_env: HashMap::new(),
        }
    }

    /// Overrides the worker program (tests and embedding).
    #[must_use]
    pub fn with_worker_program(mut self, program: std::path::PathBuf) -> Self {
        self.worker_program = Some(program);
        self
    }

    /// Validates and executes sandbox code.
    ///
    /// Helper-free code runs in the worker process; code referencing
    /// helpers runs on the calling thread against `dispatcher`.
    ///
    /// # Errors
    ///
    /// Validation failures ([`SandboxError`] variants), evaluation
    /// errors, and timeouts (after which the worker has already been
    /// replaced).
    pub fn execute(
        &mut self,
        code: &str,
        dispatcher: Option<&mut dyn HelperDispatcher>,
    ) -> Result<ExecOutcome> {
        let stmts = guard::validate(code)?;

        if references_helpers(code) {
            let deadline = Some((Instant::now() + self.timeout, self.timeout.as_secs()));
            let value = eval::execute(&stmts, &mut self.thread_env, dispatcher, deadline)
                .map_err(crate::error::Error::from)?;
            return Ok(ExecOutcome {
                value: value.to_json(),
                repr: value.repr(),
            });
        }

        self.ensure_worker()?;
        let Some(worker) = self.worker.as_mut() else {
            return Err(SandboxError::Worker {
                reason: "worker unavailable".to_string(),
            }
            .into());
        };

        match worker.execute(code, self.timeout) {
            Ok(reply) => {
                if reply.status == "ok" {
                    Ok(ExecOutcome {
                        value: reply.value.unwrap_or(serde_json::Value::Null),
                        repr: reply.repr.unwrap_or_default(),
                    })
                } else {
                    Err(SandboxError::Eval {
                        message: reply.error.unwrap_or_else(|| "unknown error".to_string()),
                    }
                    .into())
                }
            }
            Err(SandboxError::Timeout { seconds }) => {
                // Terminate, then start a fresh worker for the next call.
                self.recycle_worker();
                Err(SandboxError::Timeout { seconds }.into())
            }
            Err(other) => {
                self.recycle_worker();
                Err(other.into())
            }
        }
    }

    fn ensure_worker(&mut self) -> Result<()> {
        let alive = self.worker.as_mut().is_some_and(SandboxWorker::is_alive);
        if !alive {
            self.worker = None;
            let worker = match &self.worker_program {
                Some(program) => SandboxWorker::spawn_program(program)?,
                None => SandboxWorker::spawn()?,
            };
            self.worker = Some(worker);
        }
        Ok(())
    }

    fn recycle_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }
        if let Err(e) = self.ensure_worker() {
            tracing::warn!(error = %e, "worker restart failed; next call will retry");
        }
    }

    /// Shuts down the worker process.
    pub fn shutdown(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }
    }
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The process-wide executor, lazily constructed.
fn global_cell() -> &'static Mutex<Option<SandboxExecutor>> {
    static EXECUTOR: OnceLock<Mutex<Option<SandboxExecutor>>> = OnceLock::new();
    EXECUTOR.get_or_init(|| Mutex::new(None))
}

/// Runs a closure against the global executor, creating it on first use.
///
/// # Errors
///
/// Propagates errors from the closure; a poisoned lock surfaces as a
/// worker error.
pub fn with_global_executor<T>(
    timeout_secs: Option<u64>,
    f: impl FnOnce(&mut SandboxExecutor) -> Result<T>,
) -> Result<T> {
    let mut guard = global_cell().lock().map_err(|_| SandboxError::Worker {
        reason: "executor lock poisoned".to_string(),
    })?;
    let executor = guard
        .get_or_insert_with(|| SandboxExecutor::new(timeout_secs.unwrap_or(DEFAULT_EXEC_TIMEOUT)));
    f(executor)
}

/// Resets process-wide sandbox state. Test teardown entry point.
pub fn reset_global_state() {
    if let Ok(mut guard) = global_cell().lock()
        && let Some(mut executor) = guard.take()
    {
        executor.shutdown();
    }
    crate::cancel::reset_global();
}
