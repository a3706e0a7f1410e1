use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::VmConfig;
use crate::error::VirbyError;
use crate::signals::ShutdownCoordinator;
use crate::vm::{PauseOutcome, VmSupervisor};

/// Guest port the proxy splices into.
const GUEST_SSH_PORT: u16 = 22;
/// Splice copy buffer, per direction.
const SPLICE_BUF_SIZE: usize = 4096;

/// Live-connection accounting and the idle-TTL timer handle.
///
/// The counter and the timer are only ever touched together: accepting a
/// connection increments and disarms, closing the last connection arms.
struct Activity {
    active_connections: u64,
    last_connection_time: Option<Instant>,
    shutdown_timer: Option<JoinHandle<()>>,
}

struct ConnectionTracker {
    inner: Mutex<Activity>,
}

impl ConnectionTracker {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Activity {
                active_connections: 0,
                last_connection_time: None,
                shutdown_timer: None,
            }),
        }
    }

    /// Record an accepted connection: bump the counter, stamp the time, and
    /// cancel any armed idle timer before anything else runs.
    async fn connection_opened(&self) -> u64 {
        let mut activity = self.inner.lock().await;
        activity.active_connections += 1;
        activity.last_connection_time = Some(Instant::now());
        if let Some(timer) = activity.shutdown_timer.take() {
            timer.abort();
            debug!("idle timer cancelled by new connection");
        }
        activity.active_connections
    }

    /// Record a closed connection. Returns the remaining active count.
    async fn connection_closed(&self) -> u64 {
        let mut activity = self.inner.lock().await;
        activity.active_connections = activity.active_connections.saturating_sub(1);
        activity.active_connections
    }

    async fn active_connections(&self) -> u64 {
        self.inner.lock().await.active_connections
    }

    /// When the most recent connection was accepted, if any.
    async fn last_connection_time(&self) -> Option<Instant> {
        self.inner.lock().await.last_connection_time
    }

    /// Store a newly armed timer, replacing (and cancelling) any stale one.
    async fn arm(&self, timer: JoinHandle<()>) {
        let mut activity = self.inner.lock().await;
        if let Some(old) = activity.shutdown_timer.replace(timer) {
            old.abort();
        }
    }

    async fn disarm(&self) {
        if let Some(timer) = self.inner.lock().await.shutdown_timer.take() {
            timer.abort();
        }
    }

    #[cfg(test)]
    async fn timer_armed(&self) -> bool {
        self.inner.lock().await.shutdown_timer.is_some()
    }
}

/// Serves the activation socket: accepts clients, brings the VM up as
/// needed, splices each connection into the guest's sshd, and pauses or
/// stops the VM after the idle TTL.
pub struct Runner {
    config: VmConfig,
    supervisor: Arc<VmSupervisor>,
    signals: Arc<ShutdownCoordinator>,
    tracker: Arc<ConnectionTracker>,
    guest_port: u16,
}

impl Runner {
    pub fn new(
        config: VmConfig,
        supervisor: Arc<VmSupervisor>,
        signals: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            config,
            supervisor,
            signals,
            tracker: Arc::new(ConnectionTracker::new()),
            guest_port: GUEST_SSH_PORT,
        }
    }

    /// Main run loop.
    ///
    /// Races the shutdown event against the proxy server and the
    /// supervisor's own shutdown latch; whichever wins, the others are
    /// cancelled and a final stop always runs.
    pub async fn run(&self, listener: std::net::TcpListener) -> Result<()> {
        if self.signals.is_shutdown_requested() {
            info!("shutdown already requested, exiting immediately");
            return Ok(());
        }

        listener
            .set_nonblocking(true)
            .context("failed to make activation socket non-blocking")?;
        let listener = tokio::net::TcpListener::from_std(listener)
            .context("failed to adopt activation socket")?;

        // Always-on mode boots the VM before serving anything.
        if !self.config.on_demand {
            info!("starting VM (always-on mode)");
            self.supervisor
                .start()
                .await
                .context("initial VM start failed")?;
        }

        let mut proxy_task = tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.signals),
            Arc::clone(&self.tracker),
            self.guest_port,
        ));
        let mut supervisor_shutdown = self.supervisor.subscribe_shutdown();

        let result: Result<()> = tokio::select! {
            _ = self.signals.wait() => {
                info!("shutdown signal received, stopping");
                Ok(())
            }
            _ = async {
                while !*supervisor_shutdown.borrow_and_update() {
                    if supervisor_shutdown.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                info!("VM supervisor requested shutdown");
                Ok(())
            }
            join = &mut proxy_task => {
                match join {
                    Ok(()) => Err(anyhow::anyhow!("proxy server exited unexpectedly")),
                    Err(e) => Err(anyhow::anyhow!("proxy server panicked: {e}")),
                }
            }
        };

        // Guaranteed cleanup path, regardless of which arm won.
        proxy_task.abort();
        self.tracker.disarm().await;
        if let Err(e) = self.supervisor.stop().await {
            warn!(error = %e, "error during final VM stop");
        }

        result
    }
}

/// Accept clients on the inherited socket and spawn one handler per client.
async fn accept_loop(
    listener: tokio::net::TcpListener,
    config: VmConfig,
    supervisor: Arc<VmSupervisor>,
    signals: Arc<ShutdownCoordinator>,
    tracker: Arc<ConnectionTracker>,
    guest_port: u16,
) {
    info!(port = config.port, "proxy server listening on activation socket");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "inbound connection");
                let config = config.clone();
                let supervisor = Arc::clone(&supervisor);
                let signals = Arc::clone(&signals);
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    handle_connection(stream, config, supervisor, signals, tracker, guest_port)
                        .await;
                });
            }
            Err(e) => {
                error!(error = %e, "accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Per-connection state machine.
///
/// Errors terminate only this handler; the client sees its connection
/// closed without data and the supervisor keeps serving.
async fn handle_connection(
    client: TcpStream,
    config: VmConfig,
    supervisor: Arc<VmSupervisor>,
    signals: Arc<ShutdownCoordinator>,
    tracker: Arc<ConnectionTracker>,
    guest_port: u16,
) {
    if signals.is_shutdown_requested() || supervisor.is_shutdown_requested() {
        info!("shutdown requested, rejecting connection");
        return;
    }

    let active = tracker.connection_opened().await;
    debug!(active, "connection opened");

    if let Err(e) = proxy_to_guest(client, &config, &supervisor, guest_port).await {
        warn!(error = %e, "connection handler error");
    }

    let remaining = tracker.connection_closed().await;
    debug!(active = remaining, "connection closed");

    if config.on_demand
        && remaining == 0
        && !signals.is_shutdown_requested()
        && !supervisor.is_shutdown_requested()
    {
        arm_idle_timer(&config, &supervisor, &tracker).await;
    }
}

/// Bring the VM up (or require it up), dial the guest, and splice.
async fn proxy_to_guest(
    client: TcpStream,
    config: &VmConfig,
    supervisor: &Arc<VmSupervisor>,
    guest_port: u16,
) -> Result<(), VirbyError> {
    let ip = ensure_vm_ready(config, supervisor).await?;

    let guest = TcpStream::connect((ip.as_str(), guest_port))
        .await
        .map_err(|e| VirbyError::Runtime(format!("failed to connect to guest at {ip}: {e}")))?;
    debug!(ip = %ip, port = guest_port, "proxying connection to guest");

    splice(client, guest).await;
    Ok(())
}

/// Ensure the VM is reachable for this connection.
///
/// On-demand mode may start or resume the VM; always-on mode requires it to
/// be running already.
async fn ensure_vm_ready(
    config: &VmConfig,
    supervisor: &Arc<VmSupervisor>,
) -> Result<String, VirbyError> {
    if supervisor.is_shutdown_requested() {
        return Err(VirbyError::Runtime(
            "shutdown requested, rejecting connection".into(),
        ));
    }

    if config.on_demand {
        supervisor.safe_resume_or_start().await
    } else {
        match supervisor.ip_address().await {
            Some(ip) if supervisor.is_running() => Ok(ip),
            _ => Err(VirbyError::Runtime("VM is not running".into())),
        }
    }
}

/// Arm the idle-TTL timer. Only called when the connection count hit zero.
async fn arm_idle_timer(
    config: &VmConfig,
    supervisor: &Arc<VmSupervisor>,
    tracker: &Arc<ConnectionTracker>,
) {
    let ttl = Duration::from_secs(config.ttl_seconds);
    let on_demand = config.on_demand;
    let supervisor = Arc::clone(supervisor);
    let tracker_for_timer = Arc::clone(tracker);

    debug!(ttl_secs = ttl.as_secs(), "arming idle timer");
    let timer = tokio::spawn(async move {
        tokio::time::sleep(ttl).await;

        if tracker_for_timer.active_connections().await != 0 {
            debug!("idle TTL expired but connections are active, not shutting down");
            return;
        }

        let idle_secs = tracker_for_timer
            .last_connection_time()
            .await
            .map(|t| t.elapsed().as_secs());
        info!(idle_secs, "idle TTL expired with no active connections");
        if on_demand {
            match supervisor.safe_pause_or_stop().await {
                Ok(PauseOutcome::Paused) => info!("VM paused"),
                Ok(PauseOutcome::Stopped) => info!("VM stopped"),
                Err(e) => warn!(error = %e, "idle shutdown failed"),
            }
        } else if let Err(e) = supervisor.stop().await {
            warn!(error = %e, "idle stop failed");
        }
    });
    tracker.arm(timer).await;
}

/// Bidirectional splice: one copier per direction. Each copier terminates
/// on EOF, reset, or cancellation, and closes the opposite writer.
async fn splice(client: TcpStream, guest: TcpStream) {
    let (client_read, client_write) = client.into_split();
    let (guest_read, guest_write) = guest.into_split();

    let upstream = tokio::spawn(copy_stream(client_read, guest_write));
    let downstream = tokio::spawn(copy_stream(guest_read, client_write));
    let _ = tokio::join!(upstream, downstream);
}

async fn copy_stream(mut src: OwnedReadHalf, mut dst: OwnedWriteHalf) {
    let mut buf = [0u8; SPLICE_BUF_SIZE];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if dst.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = dst.shutdown().await;
}
