//! Two-stage cancellation.
//!
//! First interrupt: set the graceful flag, start a watchdog that will
//! force-quit after a timeout, and run the cleanup/graceful callbacks on
//! a separate thread (never in signal context). Second interrupt, or
//! watchdog expiry: force-quit with exit status 130.
//!
//! The interrupt handler itself only records the event: `ctrlc` already
//! delivers it on a dedicated thread, and this module still confines the
//! handler to flag flips plus thread spawns so callbacks can take locks
//! freely.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::error::{CancelKind, Result, SystemError};

/// Exit status for cancelled runs (128 + SIGINT).
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Default graceful window before the watchdog force-quits.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

const STATE_IDLE: u8 = 0;
const STATE_GRACEFUL: u8 = 1;
const STATE_FORCED: u8 = 2;
const STATE_COMPLETED: u8 = 3;

/// Cancellation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    /// No interrupt received.
    Idle,
    /// First interrupt: finish current work and flush.
    Graceful,
    /// Second interrupt or watchdog expiry.
    Forced,
    /// Driver saved state and disarmed the watchdog.
    Completed,
}

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_cleanup: Option<Callback>,
    on_graceful: Option<Callback>,
    on_force: Option<Callback>,
}

/// Process-wide cancellation state machine.
pub struct CancellationManager {
    state: AtomicU8,
    completed: AtomicBool,
    interrupt_count: AtomicU32,
    graceful_timeout: Mutex<Duration>,
    callbacks: Mutex<Callbacks>,
    exit_hook: Mutex<Option<Box<dyn Fn(i32) + Send + Sync>>>,
}

impl CancellationManager {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_IDLE),
            completed: AtomicBool::new(false),
            interrupt_count: AtomicU32::new(0),
            graceful_timeout: Mutex::new(DEFAULT_GRACEFUL_TIMEOUT),
            callbacks: Mutex::new(Callbacks::default()),
            exit_hook: Mutex::new(None),
        }
    }

    /// Installs the interrupt handler (SIGINT everywhere, SIGTERM on
    /// Unix via the `termination` feature). Safe to call repeatedly; the
    /// handler is installed once per process.
    pub fn setup(&'static self) {
        static INSTALLED: OnceLock<()> = OnceLock::new();
        INSTALLED.get_or_init(|| {
            if let Err(e) = ctrlc::set_handler(|| manager().handle_interrupt()) {
                tracing::warn!(error = %e, "interrupt handler installation failed");
            }
        });
    }

    /// Sets the graceful-timeout window.
    pub fn set_graceful_timeout(&self, timeout: Duration) {
        if let Ok(mut guard) = self.graceful_timeout.lock() {
            *guard = timeout;
        }
    }

    /// Registers callbacks: `cleanup` runs first (release UI resources),
    /// then `graceful`; `force` runs with a short join window on force
    /// quit.
    pub fn set_callbacks(
        &self,
        on_cleanup: Option<Callback>,
        on_graceful: Option<Callback>,
        on_force: Option<Callback>,
    ) {
        if let Ok(mut guard) = self.callbacks.lock() {
            guard.on_cleanup = on_cleanup;
            guard.on_graceful = on_graceful;
            guard.on_force = on_force;
        }
    }

    /// Replaces the process-exit behaviour (tests only).
    pub fn set_exit_hook(&self, hook: Box<dyn Fn(i32) + Send + Sync>) {
        if let Ok(mut guard) = self.exit_hook.lock() {
            *guard = Some(hook);
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CancelState {
        match self.state.load(Ordering::SeqCst) {
            STATE_GRACEFUL => CancelState::Graceful,
            STATE_FORCED => CancelState::Forced,
            STATE_COMPLETED => CancelState::Completed,
            _ => CancelState::Idle,
        }
    }

    /// Whether graceful (or forced) cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), CancelState::Graceful | CancelState::Forced)
    }

    /// Whether force quit was triggered.
    #[must_use]
    pub fn is_force_quit(&self) -> bool {
        self.state() == CancelState::Forced
    }

    /// Errors out of a blocking loop when force quit was triggered.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Cancelled`] with `kind: Forced`.
    pub fn check_force(&self) -> Result<()> {
        if self.is_force_quit() {
            return Err(SystemError::Cancelled {
                kind: CancelKind::Forced,
            }
            .into());
        }
        Ok(())
    }

    /// Marks the graceful shutdown as complete, disarming the watchdog.
    ///
    /// Must be called after the driver has saved state during a graceful
    /// cancellation; without it the watchdog force-quits when the window
    /// expires.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
        let _ = self.state.compare_exchange(
            STATE_GRACEFUL,
            STATE_COMPLETED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Handles one interrupt delivery.
    pub fn handle_interrupt(&'static self) {
        let count = self.interrupt_count.fetch_add(1, Ordering::SeqCst) + 1;

        if count == 1 {
            self.state.store(STATE_GRACEFUL, Ordering::SeqCst);
            write_stderr(
                "\n[!] Cancellation requested. Finishing current work...\n    (Press Ctrl+C again to force quit)\n",
            );

            // Callbacks run on their own thread so they may take locks.
            let spawned = std::thread::Builder::new()
                .name("cancel-callbacks".to_string())
                .spawn(move || self.run_graceful_callbacks());
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "callback thread failed to start");
            }

            let timeout = self
                .graceful_timeout
                .lock()
                .map_or(DEFAULT_GRACEFUL_TIMEOUT, |t| *t);
            let watchdog = std::thread::Builder::new()
                .name("cancel-watchdog".to_string())
                .spawn(move || {
                    std::thread::sleep(timeout);
                    if self.state.load(Ordering::SeqCst) == STATE_GRACEFUL
                        && !self.completed.load(Ordering::SeqCst)
                    {
                        write_stderr(&format!(
                            "\n[!] Graceful shutdown timed out after {}s\n    Force quitting...\n",
                            timeout.as_secs()
                        ));
                        self.state.store(STATE_FORCED, Ordering::SeqCst);
                        self.force_exit();
                    }
                });
            if let Err(e) = watchdog {
                tracing::warn!(error = %e, "watchdog thread failed to start");
            }
        } else {
            self.state.store(STATE_FORCED, Ordering::SeqCst);
            write_stderr(
                "\n[!] Force quitting...\n    Warning: Progress may not be fully saved\n",
            );

            // Give the force callback a brief join window.
            if let Ok(callbacks) = self.callbacks.lock()
                && let Some(on_force) = callbacks.on_force.as_ref()
            {
                on_force();
            }
            self.force_exit();
        }
    }

    fn run_graceful_callbacks(&self) {
        if let Ok(callbacks) = self.callbacks.lock() {
            if let Some(on_cleanup) = callbacks.on_cleanup.as_ref() {
                on_cleanup();
            }
            if let Some(on_graceful) = callbacks.on_graceful.as_ref() {
                on_graceful();
            }
        }
    }

    /// Flushes streams and terminates the process with status 130.
    fn force_exit(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        if let Ok(hook) = self.exit_hook.lock()
            && let Some(hook) = hook.as_ref()
        {
            hook(EXIT_CODE_CANCELLED);
            return;
        }
        std::process::exit(EXIT_CODE_CANCELLED);
    }

    /// Resets all cancellation state. Test teardown only.
    pub fn reset(&self) {
        self.state.store(STATE_IDLE, Ordering::SeqCst);
        self.completed.store(false, Ordering::SeqCst);
        self.interrupt_count.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.callbacks.lock() {
            *guard = Callbacks::default();
        }
        if let Ok(mut guard) = self.graceful_timeout.lock() {
            *guard = DEFAULT_GRACEFUL_TIMEOUT;
        }
        if let Ok(mut guard) = self.exit_hook.lock() {
            *guard = None;
        }
    }

    /// Prints resume instructions after a graceful save.
    pub fn show_resume_instructions(session_hash: &str) {
        const GREEN: &str = "\x1b[92m";
        const CYAN: &str = "\x1b[96m";
        const RESET: &str = "\x1b[0m";
        write_stderr(&format!(
            "\n{GREEN}Progress saved.{RESET}\nResume with: {CYAN}deepscan-rs resume {session_hash}{RESET}\n"
        ));
    }
}

fn write_stderr(message: &str) {
    let _ = std::io::stderr().write_all(message.as_bytes());
    let _ = std::io::stderr().flush();
}

/// The process-wide cancellation manager.
#[must_use]
pub fn manager() -> &'static CancellationManager {
    static MANAGER: OnceLock<CancellationManager> = OnceLock::new();
    MANAGER.get_or_init(CancellationManager::new)
}

/// Resets global cancellation state. Test teardown entry point.
pub fn reset_global() {
    manager().reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    // Each test leaks its own manager instance so the process-wide one
    // (shared with every other test in the binary) stays untouched. An
    // exit hook keeps force paths from killing the test runner.

    fn leaked_manager() -> &'static CancellationManager {
        Box::leak(Box::new(CancellationManager::new()))
    }

    fn arm_exit_capture(mgr: &CancellationManager) -> Arc<AtomicUsize> {
        let exits = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&exits);
        mgr.set_exit_hook(Box::new(move |_code| {
            captured.fetch_add(1, Ordering::SeqCst);
        }));
        exits
    }

    #[test]
    fn test_state_machine_transitions() {
        let mgr = leaked_manager();
        let exits = arm_exit_capture(mgr);

        assert_eq!(mgr.state(), CancelState::Idle);
        assert!(!mgr.is_cancelled());

        mgr.handle_interrupt();
        assert_eq!(mgr.state(), CancelState::Graceful);
        assert!(mgr.is_cancelled());
        assert!(!mgr.is_force_quit());

        mgr.handle_interrupt();
        assert_eq!(mgr.state(), CancelState::Forced);
        assert!(mgr.is_force_quit());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_completed_disarms() {
        let mgr = leaked_manager();
        let _exits = arm_exit_capture(mgr);

        mgr.handle_interrupt();
        mgr.mark_completed();
        assert_eq!(mgr.state(), CancelState::Completed);
        // A completed shutdown is no longer "cancelled" for pollers.
        assert!(!mgr.is_cancelled());
    }

    #[test]
    fn test_watchdog_force_quits_without_completion() {
        let mgr = leaked_manager();
        let exits = arm_exit_capture(mgr);
        mgr.set_graceful_timeout(Duration::from_millis(50));

        mgr.handle_interrupt();
        // The watchdog fires after the timeout because nothing called
        // mark_completed().
        for _ in 0..100 {
            if exits.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), CancelState::Forced);
    }

    #[test]
    fn test_watchdog_disarmed_by_completion() {
        let mgr = leaked_manager();
        let exits = arm_exit_capture(mgr);
        mgr.set_graceful_timeout(Duration::from_millis(50));

        mgr.handle_interrupt();
        mgr.mark_completed();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(exits.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.state(), CancelState::Completed);
    }

    #[test]
    fn test_check_force_errors_only_when_forced() {
        let mgr = leaked_manager();
        let _exits = arm_exit_capture(mgr);

        assert!(mgr.check_force().is_ok());
        mgr.handle_interrupt();
        assert!(mgr.check_force().is_ok());
        mgr.handle_interrupt();
        let err = mgr.check_force().unwrap_err();
        assert_eq!(err.exit_code(), 130);
    }

    #[test]
    fn test_graceful_callbacks_run() {
        let mgr = leaked_manager();
        let _exits = arm_exit_capture(mgr);

        let order = Arc::new(Mutex::new(Vec::new()));
        let cleanup_order = Arc::clone(&order);
        let graceful_order = Arc::clone(&order);
        mgr.set_callbacks(
            Some(Box::new(move || {
                if let Ok(mut o) = cleanup_order.lock() {
                    o.push("cleanup");
                }
            })),
            Some(Box::new(move || {
                if let Ok(mut o) = graceful_order.lock() {
                    o.push("graceful");
                }
            })),
            None,
        );

        mgr.handle_interrupt();
        // Callbacks run on a separate thread; give them a moment.
        for _ in 0..50 {
            if order.lock().map(|o| o.len() == 2).unwrap_or(false) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*order.lock().unwrap(), vec!["cleanup", "graceful"]);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mgr = leaked_manager();
        let _exits = arm_exit_capture(mgr);
        mgr.handle_interrupt();
        assert!(mgr.is_cancelled());
        mgr.reset();
        assert_eq!(mgr.state(), CancelState::Idle);
        assert!(!mgr.is_cancelled());
    }

    #[test]
    fn test_exit_code_constant() {
        assert_eq!(EXIT_CODE_CANCELLED, 130);
    }
}
