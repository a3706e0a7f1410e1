use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type ShutdownHook = Box<dyn Fn() + Send + Sync>;

/// Coordinates SIGINT/SIGTERM handling and shutdown fan-out.
///
/// Handlers are installed exactly once; later install attempts are no-ops.
/// The shutdown event is monotonic (false -> true) and observable through
/// [`ShutdownCoordinator::subscribe`]. Registered hooks run once, on the
/// first signal or programmatic shutdown request.
pub struct ShutdownCoordinator {
    shutdown_tx: watch::Sender<bool>,
    installed: AtomicBool,
    interrupted: AtomicBool,
    hooks: Mutex<Vec<ShutdownHook>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            installed: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook to run when shutdown is triggered.
    pub fn add_shutdown_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().expect("hook registry poisoned").push(Box::new(hook));
    }

    /// Install SIGINT and SIGTERM handlers. Idempotent: only the first call
    /// installs anything. The signal streams are created before this returns,
    /// so a signal arriving immediately afterwards is not lost.
    pub fn install(self: &std::sync::Arc<Self>) -> anyhow::Result<()> {
        if self
            .installed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("signal handlers already installed");
            return Ok(());
        }

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let this = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating shutdown");
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, initiating shutdown");
                    this.interrupted.store(true, Ordering::SeqCst);
                }
            }
            this.trigger();
        });

        debug!("signal handlers installed");
        Ok(())
    }

    /// Request shutdown without a signal (e.g. after an idle-TTL stop in
    /// always-on mode, or when the VM monitor observes a fatal exit).
    pub fn request_shutdown(&self) {
        info!("shutdown requested programmatically");
        self.trigger();
    }

    fn trigger(&self) {
        // send_replace rather than send: the event must latch even with no
        // live receivers.
        let was_shutdown = self.shutdown_tx.send_replace(true);
        if was_shutdown {
            return;
        }
        for hook in self.hooks.lock().expect("hook registry poisoned").iter() {
            // A panicking hook must not take down the signal task.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook)).is_err() {
                warn!("shutdown hook panicked");
            }
        }
    }

    /// Receiver that observes the shutdown event.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait until shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// True when the triggering signal was an interrupt (exit code 130).
    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}
