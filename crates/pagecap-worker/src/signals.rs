//! Process-wide shutdown.
//!
//! SIGINT, SIGTERM, SIGHUP and panics all end the same way: every tracked
//! child process is flushed, then the recorder exits with a code that names
//! the cause.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use pagecap_media::ProcessRegistry;

/// Why the recorder is shutting down early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Interrupt,
    Terminate,
    Hangup,
    Panic,
}

impl ShutdownCause {
    /// Conventional `128 + signal` codes; 1 for a panic.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownCause::Interrupt => 130,
            ShutdownCause::Terminate => 143,
            ShutdownCause::Hangup => 129,
            ShutdownCause::Panic => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownCause::Interrupt => "SIGINT",
            ShutdownCause::Terminate => "SIGTERM",
            ShutdownCause::Hangup => "SIGHUP",
            ShutdownCause::Panic => "panic",
        }
    }
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chain a panic hook that wakes `notify` after the default report.
pub fn install_panic_hook(notify: Arc<Notify>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        notify.notify_one();
    }));
}

/// Listens for shutdown causes. Signal handlers are registered on creation
/// so that a failure surfaces before any job starts.
pub struct ShutdownListener {
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
    panicked: Arc<Notify>,
}

impl ShutdownListener {
    pub fn new(panicked: Arc<Notify>) -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            panicked,
        })
    }

    pub async fn recv(&mut self) -> ShutdownCause {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for SIGINT: {}", e);
                    std::future::pending::<()>().await;
                }
                ShutdownCause::Interrupt
            }
            _ = self.sigterm.recv() => ShutdownCause::Terminate,
            _ = self.sighup.recv() => ShutdownCause::Hangup,
            _ = self.panicked.notified() => ShutdownCause::Panic,
        }
    }
}

/// Install the panic hook and spawn the task that flushes `registry` and
/// exits the process on the first shutdown cause.
pub fn spawn_shutdown_handler(registry: Arc<ProcessRegistry>) -> io::Result<JoinHandle<()>> {
    let panicked = Arc::new(Notify::new());
    let mut listener = ShutdownListener::new(Arc::clone(&panicked))?;
    install_panic_hook(panicked);

    Ok(tokio::spawn(async move {
        let cause = listener.recv().await;
        warn!(
            cause = cause.as_str(),
            processes = registry.len(),
            "Shutting down, stopping all child processes"
        );
        registry.flush_all(cause.as_str()).await;
        std::process::exit(cause.exit_code());
    }))
}
