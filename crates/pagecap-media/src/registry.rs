//! Registry of spawned OS processes.
//!
//! Every process started on behalf of a job is tracked here under a unique
//! name. A watcher task owns each child and removes its entry as soon as the
//! process exits, so the registry only ever lists live processes. Shutdown
//! paths call [`ProcessRegistry::flush_all`], which runs at most once per
//! registry no matter how many signals arrive.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// Grace period given to every process during a registry flush.
pub const FLUSH_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for the kernel to reap a process after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How a tracked process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Exit whose status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Cloneable view of a tracked process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: Arc<str>,
    pid: u32,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status if the process has already exited.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Wait until the process exits.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(exit) = current {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Watcher went away without reporting (runtime shutdown)
                return (*rx.borrow()).unwrap_or_else(ProcessExit::unknown);
            }
        }
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

/// Result of [`ProcessRegistry::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process was gone before any signal was sent.
    AlreadyExited(ProcessExit),
    /// The process exited within the grace period.
    Exited(ProcessExit),
    /// The grace period expired and SIGKILL was issued.
    Killed(Option<ProcessExit>),
}

impl TerminateOutcome {
    pub fn was_forced(&self) -> bool {
        matches!(self, TerminateOutcome::Killed(_))
    }
}

struct TrackedProcess {
    id: u64,
    handle: ProcessHandle,
}

type CleanupHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Process-wide registry of live child processes.
///
/// Created once at startup and shared by reference with the scheduler and
/// every job.
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, TrackedProcess>>,
    next_id: AtomicU64,
    cleanup_hooks: Mutex<Vec<(String, CleanupHook)>>,
    flushed: OnceCell<()>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cleanup_hooks: Mutex::new(Vec::new()),
            flushed: OnceCell::new(),
        }
    }

    /// Start tracking `child` under `name`.
    ///
    /// Returns `None` (and logs a warning) when the child has no pid because
    /// it was already reaped, or when `name` is taken. A rejected child is
    /// dropped, which kills it if it was spawned with `kill_on_drop`.
    pub fn track(self: &Arc<Self>, name: impl Into<String>, mut child: Child) -> Option<ProcessHandle> {
        let name = name.into();
        let Some(pid) = child.id() else {
            warn!(process = %name, "Not tracking process without a pid");
            return None;
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle {
            name: Arc::from(name.as_str()),
            pid,
            exit_rx,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = lock(&self.entries);
            if entries.contains_key(&name) {
                warn!(process = %name, pid, "A process with this name is already tracked");
                return None;
            }
            entries.insert(
                name.clone(),
                TrackedProcess {
                    id,
                    handle: handle.clone(),
                },
            );
        }
        debug!(process = %name, pid, "Tracking process");

        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ProcessExit::from_status(status),
                Err(e) => {
                    warn!(process = %name, pid, "Failed to wait for process: {}", e);
                    ProcessExit::unknown()
                }
            };
            // Remove before publishing the exit so waiters observe a consistent registry
            if let Some(registry) = registry.upgrade() {
                if registry.remove_entry(&name, id) {
                    debug!(process = %name, pid, %exit, "Tracked process exited");
                }
            }
            let _ = exit_tx.send(Some(exit));
        });

        Some(handle)
    }

    /// Stop tracking `name` without signalling it.
    pub fn untrack(&self, name: &str) -> Option<ProcessHandle> {
        let removed = lock(&self.entries).remove(name).map(|e| e.handle);
        if removed.is_some() {
            debug!(process = %name, "Untracked process");
        }
        removed
    }

    fn remove_entry(&self, name: &str, id: u64) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(name) {
            Some(entry) if entry.id == id => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Send `signal`, wait up to `grace` for exit, then escalate to SIGKILL.
    ///
    /// Resolves once the process has exited or SIGKILL has been issued.
    pub async fn terminate(
        &self,
        handle: &ProcessHandle,
        signal: Signal,
        grace: Duration,
    ) -> TerminateOutcome {
        if let Some(exit) = handle.exit_status() {
            return TerminateOutcome::AlreadyExited(exit);
        }

        debug!(process = %handle.name(), pid = handle.pid(), ?signal, "Terminating process");
        match send_signal(handle.pid(), signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                let exit = handle
                    .wait_timeout(KILL_REAP_TIMEOUT)
                    .await
                    .unwrap_or_else(ProcessExit::unknown);
                return TerminateOutcome::AlreadyExited(exit);
            }
            Err(e) => {
                warn!(process = %handle.name(), pid = handle.pid(), "Failed to send {:?}: {}", signal, e);
            }
        }

        if let Some(exit) = handle.wait_timeout(grace).await {
            return TerminateOutcome::Exited(exit);
        }

        warn!(
            process = %handle.name(),
            pid = handle.pid(),
            grace_secs = grace.as_secs_f64(),
            "Process still alive after {:?}, sending SIGKILL",
            signal
        );
        metrics::counter!("pagecap_processes_force_killed_total").increment(1);
        if let Err(e) = send_signal(handle.pid(), Signal::SIGKILL) {
            if e != Errno::ESRCH {
                warn!(process = %handle.name(), pid = handle.pid(), "Failed to send SIGKILL: {}", e);
            }
        }

        TerminateOutcome::Killed(handle.wait_timeout(KILL_REAP_TIMEOUT).await)
    }

    /// Register a hook that runs first during [`flush_all`](Self::flush_all).
    pub fn register_cleanup<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: CleanupHook = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(hook()) });
        lock(&self.cleanup_hooks).push((name.into(), hook));
    }

    /// Run cleanup hooks, terminate every tracked process in parallel and
    /// clear the registry.
    ///
    /// Only the first call performs the flush; concurrent callers wait for it
    /// to finish. Returns `true` for the call that performed it.
    pub async fn flush_all(&self, reason: &str) -> bool {
        let performed = AtomicBool::new(false);
        let ran = &performed;
        self.flushed
            .get_or_init(|| async move {
                ran.store(true, Ordering::SeqCst);
                self.run_flush(reason).await;
            })
            .await;
        performed.load(Ordering::SeqCst)
    }

    async fn run_flush(&self, reason: &str) {
        let hooks: Vec<(String, CleanupHook)> = lock(&self.cleanup_hooks)
            .iter()
            .map(|(name, hook)| (name.clone(), Arc::clone(hook)))
            .collect();

        info!(reason, hooks = hooks.len(), "Flushing process registry");
        for (name, hook) in hooks {
            debug!(hook = %name, "Running cleanup hook");
            hook().await;
        }

        let processes: Vec<ProcessHandle> = lock(&self.entries)
            .values()
            .map(|e| e.handle.clone())
            .collect();
        if !processes.is_empty() {
            info!(count = processes.len(), "Terminating tracked processes");
        }

        let outcomes = join_all(
            processes
                .iter()
                .map(|h| self.terminate(h, Signal::SIGTERM, FLUSH_GRACE_PERIOD)),
        )
        .await;
        let forced = outcomes.iter().filter(|o| o.was_forced()).count();

        lock(&self.entries).clear();
        info!(terminated = outcomes.len(), forced, "Process registry flushed");
    }

    /// Whether a flush has run (or is running).
    pub fn is_flushed(&self) -> bool {
        self.flushed.initialized()
    }

    /// Live processes whose name ends with `suffix`.
    pub fn tracked_with_suffix(&self, suffix: &str) -> Vec<ProcessHandle> {
        lock(&self.entries)
            .iter()
            .filter(|(name, _)| name.ends_with(suffix))
            .map(|(_, e)| e.handle.clone())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.entries).contains_key(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), Errno> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::process::Command;

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .expect("spawn test process")
    }

    #[tokio::test]
    async fn test_natural_exit_removes_entry() {
        let registry = Arc::new(ProcessRegistry::new());
        let handle = registry.track("job1:true", spawn("true", &[])).unwrap();

        let exit = handle.wait().await;
        assert!(exit.success());
        assert!(!registry.contains("job1:true"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let registry = Arc::new(ProcessRegistry::new());
        let first = registry.track("dup", spawn("sleep", &["30"])).unwrap();
        assert!(registry.track("dup", spawn("sleep", &["30"])).is_none());
        assert_eq!(registry.len(), 1);

        registry
            .terminate(&first, Signal::SIGTERM, Duration::from_secs(2))
            .await;
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let registry = Arc::new(ProcessRegistry::new());
        let handle = registry.track("sleeper", spawn("sleep", &["30"])).unwrap();

        let outcome = registry
            .terminate(&handle, Signal::SIGTERM, Duration::from_secs(5))
            .await;

        match outcome {
            TerminateOutcome::Exited(exit) => assert_eq!(exit.signal, Some(libc_sigterm())),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(registry.is_empty());

        let again = registry
            .terminate(&handle, Signal::SIGTERM, Duration::from_secs(1))
            .await;
        assert!(matches!(again, TerminateOutcome::AlreadyExited(_)));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let registry = Arc::new(ProcessRegistry::new());
        let child = spawn(
            "sh",
            &["-c", "trap '' TERM; while true; do sleep 0.1; done"],
        );
        let handle = registry.track("stubborn", child).unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = registry
            .terminate(&handle, Signal::SIGTERM, Duration::from_millis(500))
            .await;

        assert!(outcome.was_forced());
        assert!(handle.wait_timeout(Duration::from_secs(2)).await.is_some());
    }

    #[tokio::test]
    async fn test_tracked_with_suffix() {
        let registry = Arc::new(ProcessRegistry::new());
        registry.track("job1:ffmpeg", spawn("sleep", &["30"])).unwrap();
        registry.track("job1:xvfb", spawn("sleep", &["30"])).unwrap();

        let found = registry.tracked_with_suffix(":ffmpeg");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "job1:ffmpeg");

        registry.flush_all("test").await;
        assert!(registry.tracked_with_suffix(":ffmpeg").is_empty());
    }

    #[tokio::test]
    async fn test_untrack_does_not_kill() {
        let registry = Arc::new(ProcessRegistry::new());
        registry.track("keep", spawn("sleep", &["30"])).unwrap();

        let handle = registry.untrack("keep").unwrap();
        assert!(registry.is_empty());
        assert!(!handle.has_exited());
        assert!(registry.untrack("keep").is_none());

        registry
            .terminate(&handle, Signal::SIGKILL, Duration::from_secs(2))
            .await;
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_concurrent_flush_runs_once() {
        let registry = Arc::new(ProcessRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register_cleanup("count", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let handle = registry.track("victim", spawn("sleep", &["30"])).unwrap();

        let (a, b) = tokio::join!(registry.flush_all("SIGINT"), registry.flush_all("SIGTERM"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(a ^ b, "exactly one caller performs the flush");
        assert!(registry.is_empty());
        assert!(registry.is_flushed());
        assert!(handle.has_exited());

        assert!(!registry.flush_all("exit").await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn libc_sigterm() -> i32 {
        Signal::SIGTERM as i32
    }
}
