use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::command::build_vfkit_command;
use super::pidfile::PidFile;
use crate::api::{StateChange, VfkitClient, VmState};
use crate::config::VmConfig;
use crate::error::VirbyError;
use crate::ip_discovery::LeaseWatcher;
use crate::ssh::SshProber;

/// Budget for the pause-precondition query in safe-pause-or-stop.
const PAUSE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Upper bound on the pause share of the safe-pause-or-stop budget.
const PAUSE_BUDGET_CAP: Duration = Duration::from_secs(15);
/// Floor for the stop share of the safe-pause-or-stop budget.
const STOP_BUDGET_FLOOR: Duration = Duration::from_secs(10);

/// Outcome of [`VmSupervisor::safe_pause_or_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    Paused,
    Stopped,
}

/// Mutable process state, guarded by one lock (single event loop).
#[derive(Default, Debug)]
struct ProcState {
    pid: Option<i32>,
    ip_address: Option<String>,
    /// Becomes `true` when the monitor observes child exit.
    exit_rx: Option<watch::Receiver<bool>>,
    monitor_task: Option<JoinHandle<()>>,
    drain_task: Option<JoinHandle<()>>,
    pid_file: Option<PidFile>,
}

/// Supervises the single vfkit child of this process.
///
/// At most one child exists at a time: `start` refuses while a process
/// handle is present, the monitor clears it exactly once on exit, and the
/// locked PID file is the cross-process witness.
#[derive(Debug)]
pub struct VmSupervisor {
    config: VmConfig,
    working_dir: PathBuf,
    mac_address: String,
    vfkit_program: String,
    /// Child process alive. Gates the REST client.
    vm_running: Arc<AtomicBool>,
    /// Latched by `stop`; once set, the VM is never started again in this
    /// process. The runner exits and launchd re-activates on demand.
    shutdown_tx: watch::Sender<bool>,
    /// Set while a deliberate stop is signalling the child, so the monitor
    /// does not report the exit as unexpected.
    stopping: AtomicBool,
    state: Mutex<ProcState>,
    discovery: Mutex<LeaseWatcher>,
    prober: SshProber,
    api: Mutex<Option<Arc<VfkitClient>>>,
    api_base_url: String,
}

/// `02:94` (locally administered, unicast) plus four random octets.
fn generate_mac_address() -> String {
    let mut rng = rand::thread_rng();
    let suffix: [u8; 4] = rng.r#gen();
    format!(
        "02:94:{:02x}:{:02x}:{:02x}:{:02x}",
        suffix[0], suffix[1], suffix[2], suffix[3]
    )
}

impl VmSupervisor {
    /// Create a supervisor rooted at the configured working directory.
    ///
    /// The MAC address is generated here, once per supervisor instance.
    pub fn new(config: VmConfig) -> Result<Self, VirbyError> {
        let working_dir = config.working_directory();
        Self::with_working_dir(config, working_dir)
    }

    pub fn with_working_dir(config: VmConfig, working_dir: PathBuf) -> Result<Self, VirbyError> {
        if !working_dir.is_dir() {
            return Err(VirbyError::Startup(format!(
                "working directory does not exist: {}",
                working_dir.display()
            )));
        }

        let mac_address = generate_mac_address();
        let (shutdown_tx, _) = watch::channel(false);
        let api_base_url = format!("http://localhost:{}", config.vfkit_api_port());

        Ok(Self {
            discovery: Mutex::new(LeaseWatcher::new(&mac_address)),
            prober: SshProber::new(&working_dir),
            mac_address,
            working_dir,
            vfkit_program: "vfkit".to_string(),
            vm_running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            stopping: AtomicBool::new(false),
            state: Mutex::new(ProcState::default()),
            api: Mutex::new(None),
            api_base_url,
            config,
        })
    }

    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    pub fn is_running(&self) -> bool {
        self.vm_running.load(Ordering::SeqCst)
    }

    pub async fn ip_address(&self) -> Option<String> {
        self.state.lock().await.ip_address.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Observe the supervisor-level shutdown latch (set by `stop`).
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Latch supervisor shutdown without touching the process.
    ///
    /// Registered as a shutdown hook by the CLI entry: a signal immediately
    /// forbids further starts and resumes, and any readiness wait already in
    /// flight aborts at its next shutdown check.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Start the VM and wait until it is reachable. Returns the guest IP.
    ///
    /// On any readiness failure the partially-started process is torn down
    /// before the error propagates, so a later attempt starts clean.
    pub async fn start(self: &Arc<Self>) -> Result<String, VirbyError> {
        if self.is_shutdown_requested() {
            return Err(VirbyError::Runtime(
                "shutdown requested, not starting VM".into(),
            ));
        }

        self.spawn_vm_process().await?;

        match self.wait_until_ready().await {
            Ok(ip) => {
                self.state.lock().await.ip_address = Some(ip.clone());
                info!(ip = %ip, "VM is ready");
                Ok(ip)
            }
            Err(e) => {
                error!(error = %e, "failed to start VM");
                self.stop_process(Duration::from_secs(self.config.stop_timeout))
                    .await;
                Err(e)
            }
        }
    }

    async fn spawn_vm_process(self: &Arc<Self>) -> Result<(), VirbyError> {
        let mut state = self.state.lock().await;
        if state.pid.is_some() {
            return Err(VirbyError::Startup("VM process is already running".into()));
        }

        // Build the control-plane client first: it cannot leak a child.
        let client = VfkitClient::with_base_url(
            self.api_base_url.clone(),
            Arc::clone(&self.vm_running),
        )?;

        let args = build_vfkit_command(&self.config, &self.working_dir, &self.mac_address);
        info!(command = %format!("{} {}", self.vfkit_program, args.join(" ")), "starting VM");

        let mut cmd = Command::new(&self.vfkit_program);
        cmd.args(&args)
            .current_dir(&self.working_dir)
            .process_group(0)
            .stdin(Stdio::null());
        if self.config.debug {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| VirbyError::Startup(format!("failed to start VM process: {e}")))?;
        let pid = child.id().ok_or_else(|| {
            VirbyError::Startup("VM process exited before its PID could be read".into())
        })? as i32;

        // The PID file is durable before the VM is advertised anywhere.
        let pid_file = PidFile::write(&self.working_dir, pid as u32)?;

        if self.config.debug {
            state.drain_task = Some(spawn_output_drain(&mut child));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        state.monitor_task = Some(tokio::spawn(async move {
            monitor.monitor_vm(child, exit_tx).await;
        }));

        state.pid = Some(pid);
        state.exit_rx = Some(exit_rx);
        state.pid_file = Some(pid_file);
        self.vm_running.store(true, Ordering::SeqCst);
        info!(pid, mac = %self.mac_address, "VM process started");

        drop(state);

        *self.api.lock().await = Some(Arc::new(client));
        Ok(())
    }

    /// Await child exit, log it, and clear in-memory VM state so a
    /// subsequent start may run.
    async fn monitor_vm(self: Arc<Self>, mut child: tokio::process::Child, exit_tx: watch::Sender<bool>) {
        let status = child.wait().await;

        match &status {
            Ok(s) if s.success() => info!("VM shut down normally"),
            Ok(s) => {
                if self.is_shutdown_requested() || self.stopping.load(Ordering::SeqCst) {
                    debug!(code = s.code(), "VM process exited during stop");
                } else {
                    error!(code = s.code(), "VM process died unexpectedly");
                }
            }
            Err(e) => error!(error = %e, "failed to await VM process"),
        }

        self.vm_running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.pid = None;
        state.ip_address = None;
        if let Some(drain) = state.drain_task.take() {
            drain.abort();
        }
        // The PID file handle stays: an unprompted crash leaves the file in
        // place for the next start (or stop) to reclaim, and the held lock
        // keeps a concurrent orphan pass away while this process lives.
        drop(state);

        let _ = exit_tx.send(true);
    }

    async fn wait_until_ready(&self) -> Result<String, VirbyError> {
        let ip = self.discover_ip().await?;
        self.wait_for_ssh(&ip).await?;
        Ok(ip)
    }

    /// Poll the DHCP lease database until the guest's MAC resolves.
    ///
    /// Backoff runs 100 ms to 2 s, bounded overall by
    /// `ip_discovery_timeout`; child death or shutdown aborts early.
    pub(crate) async fn discover_ip(&self) -> Result<String, VirbyError> {
        debug!(mac = %self.mac_address, "discovering VM IP address");
        let deadline = Instant::now() + Duration::from_secs(self.config.ip_discovery_timeout);
        let mut interval = Duration::from_millis(100);

        loop {
            if self.is_shutdown_requested() {
                return Err(VirbyError::Runtime(
                    "shutdown requested during IP discovery".into(),
                ));
            }
            if !self.is_running() {
                return Err(VirbyError::Runtime(
                    "VM process died during IP discovery".into(),
                ));
            }

            if let Some(ip) = self.discovery.lock().await.lookup().await? {
                info!(ip = %ip, "discovered VM IP address");
                return Ok(ip);
            }

            if Instant::now() >= deadline {
                return Err(VirbyError::Runtime(format!(
                    "failed to discover VM IP within {} seconds",
                    self.config.ip_discovery_timeout
                )));
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(Duration::from_secs(2));
        }
    }

    /// Poll the SSH probe (500 ms to 1 s backoff) until the guest's sshd
    /// accepts a key within `ssh_ready_timeout`.
    async fn wait_for_ssh(&self, ip: &str) -> Result<(), VirbyError> {
        debug!(ip = %ip, "waiting for guest sshd");
        let deadline = Instant::now() + Duration::from_secs(self.config.ssh_ready_timeout);
        let mut interval = Duration::from_millis(500);

        loop {
            if self.is_shutdown_requested() {
                return Err(VirbyError::Runtime(
                    "shutdown requested while waiting for SSH".into(),
                ));
            }
            if !self.is_running() {
                return Err(VirbyError::Runtime(
                    "VM process died while waiting for SSH".into(),
                ));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(VirbyError::SshConnectivity(format!(
                    "SSH did not become ready within {} seconds",
                    self.config.ssh_ready_timeout
                )));
            }

            let attempt_budget = remaining.min(Duration::from_secs(10)).max(Duration::from_secs(1));
            if self.prober.probe(ip, attempt_budget).await {
                info!(ip = %ip, "guest sshd is ready");
                return Ok(());
            }

            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(Duration::from_secs(1));
        }
    }

    /// Stop the VM and latch supervisor shutdown.
    ///
    /// Once latched, no further connection may start or resume the VM; the
    /// runner exits and launchd re-activates the service on the next client.
    /// Repeated stops are no-ops.
    pub async fn stop(&self) -> Result<(), VirbyError> {
        self.stop_with_timeout(Duration::from_secs(self.config.stop_timeout))
            .await
    }

    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<(), VirbyError> {
        self.request_shutdown();
        self.stop_process(timeout).await;
        Ok(())
    }

    /// Stop the VM process without latching shutdown: used when tearing
    /// down a half-started or unresumable VM before a fresh start.
    async fn stop_process(&self, timeout: Duration) {
        self.stopping.store(true, Ordering::SeqCst);

        let (pid, exit_rx) = {
            let mut state = self.state.lock().await;
            if let Some(drain) = state.drain_task.take() {
                drain.abort();
            }
            (state.pid, state.exit_rx.clone())
        };

        if let (Some(pid), true) = (pid, self.is_running()) {
            info!(pid, "stopping VM");
            signal_process_group(pid, libc::SIGTERM);

            if wait_for_exit(exit_rx.clone(), timeout).await {
                info!("VM stopped gracefully");
            } else {
                warn!(pid, "VM did not stop within {}s, killing", timeout.as_secs());
                signal_process_group(pid, libc::SIGKILL);
                if !wait_for_exit(exit_rx, timeout).await {
                    error!(pid, "VM process survived SIGKILL wait");
                }
            }
        }

        // Drop the REST client; its connection pool closes with it.
        *self.api.lock().await = None;

        let mut state = self.state.lock().await;
        state.ip_address = None;
        state.pid = None;
        state.exit_rx = None;
        if let Some(pid_file) = state.pid_file.take() {
            pid_file.remove();
        }
        if let Some(monitor) = state.monitor_task.take() {
            // Exited or never started; either way the task is done with.
            monitor.abort();
        }
        drop(state);

        self.stopping.store(false, Ordering::SeqCst);
    }

    async fn api_client(&self) -> Result<Arc<VfkitClient>, VirbyError> {
        self.api
            .lock()
            .await
            .clone()
            .ok_or_else(|| VirbyError::Runtime("VM is not running".into()))
    }

    /// Pause the VM. Requires the current state to report `canPause`.
    pub async fn pause(&self) -> Result<(), VirbyError> {
        self.pause_with_timeout(Duration::from_secs(self.config.pause_timeout))
            .await
    }

    async fn pause_with_timeout(&self, timeout: Duration) -> Result<(), VirbyError> {
        let api = self.api_client().await?;
        let state = api.vm_state().await?;
        if !state.can_pause {
            return Err(VirbyError::Runtime(format!(
                "VM cannot be paused in state {:?}",
                state.state
            )));
        }

        tokio::time::timeout(timeout, api.set_vm_state(StateChange::Pause))
            .await
            .map_err(|_| {
                VirbyError::Runtime(format!("pause timed out after {}s", timeout.as_secs()))
            })??;
        info!("VM paused");
        Ok(())
    }

    /// Resume the VM. Requires the current state to report `canResume`.
    pub async fn resume(&self) -> Result<(), VirbyError> {
        let timeout = Duration::from_secs(self.config.resume_timeout);
        let api = self.api_client().await?;
        let state = api.vm_state().await?;
        if !state.can_resume {
            return Err(VirbyError::Runtime(format!(
                "VM cannot be resumed in state {:?}",
                state.state
            )));
        }

        tokio::time::timeout(timeout, api.set_vm_state(StateChange::Resume))
            .await
            .map_err(|_| {
                VirbyError::Runtime(format!("resume timed out after {}s", timeout.as_secs()))
            })??;
        info!("VM resumed");
        Ok(())
    }

    /// Pause if possible, stop otherwise.
    ///
    /// The pause precondition gets a 3 s probe; pause itself gets half the
    /// budget capped at 15 s. Any failure falls back to a latching stop
    /// with the remaining budget, floored at 10 s.
    pub async fn safe_pause_or_stop(&self) -> Result<PauseOutcome, VirbyError> {
        let budget = Duration::from_secs(self.config.stop_timeout);
        let started = Instant::now();

        let can_pause = match tokio::time::timeout(PAUSE_PROBE_TIMEOUT, async {
            self.api_client().await?.vm_state().await
        })
        .await
        {
            Ok(Ok(state)) => state.can_pause,
            Ok(Err(e)) => {
                debug!(error = %e, "pause precondition query failed");
                false
            }
            Err(_) => {
                debug!("pause precondition query timed out");
                false
            }
        };

        if can_pause {
            let pause_budget = (budget / 2).min(PAUSE_BUDGET_CAP);
            match self.pause_with_timeout(pause_budget).await {
                Ok(()) => return Ok(PauseOutcome::Paused),
                Err(e) => warn!(error = %e, "pause failed, falling back to stop"),
            }
        }

        let remaining = budget
            .saturating_sub(started.elapsed())
            .max(STOP_BUDGET_FLOOR);
        self.stop_with_timeout(remaining).await?;
        Ok(PauseOutcome::Stopped)
    }

    /// Bring the VM to a reachable state by the cheapest available path.
    ///
    /// Running: reuse (or rediscover) the IP. Paused: resume, falling back
    /// to stop-then-start on any failure. Stopped or absent: fresh start.
    /// Transitional states reject the attempt.
    pub async fn safe_resume_or_start(self: &Arc<Self>) -> Result<String, VirbyError> {
        if self.is_shutdown_requested() {
            return Err(VirbyError::Runtime(
                "shutdown requested, not starting VM".into(),
            ));
        }

        if !self.is_running() {
            return self.start().await;
        }

        let state = match self.api_client().await?.vm_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "failed to query VM state, restarting VM");
                return self.restart().await;
            }
        };

        match state.state {
            VmState::Running => match self.ip_address().await {
                Some(ip) => Ok(ip),
                None => {
                    let ip = self.discover_ip().await?;
                    self.state.lock().await.ip_address = Some(ip.clone());
                    Ok(ip)
                }
            },
            VmState::Paused if state.can_resume => match self.resume().await {
                Ok(()) => match self.ip_address().await {
                    Some(ip) => Ok(ip),
                    None => {
                        let ip = self.discover_ip().await?;
                        self.state.lock().await.ip_address = Some(ip.clone());
                        Ok(ip)
                    }
                },
                Err(e) => {
                    warn!(error = %e, "resume failed, restarting VM");
                    self.restart().await
                }
            },
            VmState::Paused | VmState::Error | VmState::Stopped => {
                warn!(state = ?state.state, "VM is not resumable, restarting");
                self.restart().await
            }
            other => Err(VirbyError::Runtime(format!(
                "VM is {other:?}; rejecting connection"
            ))),
        }
    }

    async fn restart(self: &Arc<Self>) -> Result<String, VirbyError> {
        self.stop_process(Duration::from_secs(self.config.stop_timeout))
            .await;
        self.start().await
    }

    /// Pretend the VM is up at `ip` without spawning anything.
    #[cfg(test)]
    pub(crate) fn test_force_running(&self, ip: &str) {
        self.vm_running.store(true, Ordering::SeqCst);
        self.state
            .try_lock()
            .expect("state lock uncontended in tests")
            .ip_address = Some(ip.to_string());
    }
}

/// SIGTERM/SIGKILL the whole vfkit process group, falling back to the
/// child alone when the group is gone.
fn signal_process_group(pid: i32, signal: libc::c_int) {
    if unsafe { libc::kill(-pid, signal) } != 0 {
        let _ = unsafe { libc::kill(pid, signal) };
    }
}

/// True once the monitor has observed child exit (or was torn down).
async fn wait_for_exit(exit_rx: Option<watch::Receiver<bool>>, timeout: Duration) -> bool {
    let Some(mut rx) = exit_rx else {
        return true;
    };
    tokio::time::timeout(timeout, async move {
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .is_ok()
}

/// Drain piped stdout/stderr so the child never blocks on a full pipe.
fn spawn_output_drain(child: &mut tokio::process::Child) -> JoinHandle<()> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::spawn(async move {
        let out = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stream = "stdout", "vfkit: {line}");
                }
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stream = "stderr", "vfkit: {line}");
                }
            }
        };
        tokio::join!(out, err);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::VM_HOST_NAME;
    use crate::ip_discovery::normalize_mac;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> VmConfig {
        VmConfig::parse(
            r#"{"cores": 1, "memory": 1024, "port": 31222,
                "ip_discovery_timeout": 2, "ssh_ready_timeout": 2}"#,
        )
        .unwrap()
    }

    /// A stand-in for vfkit that ignores its argument vector and stays up.
    fn fake_vfkit(dir: &Path) -> String {
        let path = dir.join("fake-vfkit");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn write_lease(dir: &Path, mac: &str, ip: &str) -> PathBuf {
        let path = dir.join("dhcpd_leases");
        std::fs::write(
            &path,
            format!(
                "{{\n\tname={VM_HOST_NAME}\n\tip_address={ip}\n\thw_address=1,{}\n}}\n",
                normalize_mac(mac)
            ),
        )
        .unwrap();
        path
    }

    /// Supervisor wired to a fake vfkit, a private lease file, and an SSH
    /// probe that always succeeds.
    fn ready_supervisor(dir: &Path) -> VmSupervisor {
        let mut sup = VmSupervisor::with_working_dir(test_config(), dir.to_path_buf()).unwrap();
        sup.vfkit_program = fake_vfkit(dir);
        let leases = write_lease(dir, &sup.mac_address().to_string(), "192.168.64.7");
        sup.discovery = Mutex::new(LeaseWatcher::with_path(sup.mac_address(), &leases));
        std::fs::write(dir.join("ssh_user_ed25519_key"), "key").unwrap();
        sup.prober = SshProber::new(dir).with_program("true");
        sup
    }

    /// Canned control plane: answers every request with `body`.
    async fn spawn_control_plane(body: &'static str) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn test_start_discovers_ip_and_writes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ready_supervisor(dir.path()));

        let ip = sup.start().await.unwrap();
        assert_eq!(ip, "192.168.64.7");
        assert!(sup.is_running());
        assert_eq!(sup.ip_address().await.as_deref(), Some("192.168.64.7"));

        let pid_content = std::fs::read_to_string(dir.path().join("vfkit.pid")).unwrap();
        let pid: i32 = pid_content.trim().parse().unwrap();
        assert_eq!(Some(pid), sup.state.lock().await.pid);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ready_supervisor(dir.path()));
        sup.start().await.unwrap();

        let err = sup.spawn_vm_process().await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_terminates_process_and_removes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ready_supervisor(dir.path()));
        sup.start().await.unwrap();

        sup.stop().await.unwrap();
        assert!(!sup.is_running());
        assert_eq!(sup.ip_address().await, None);
        assert!(!dir.path().join("vfkit.pid").exists());
        assert!(sup.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_repeated_stop_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ready_supervisor(dir.path()));
        sup.start().await.unwrap();

        sup.stop().await.unwrap();
        sup.stop().await.unwrap();
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_start_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = VmSupervisor::with_working_dir(test_config(), dir.path().to_path_buf()).unwrap();
        // Child dies immediately: discovery aborts with a Runtime error.
        sup.vfkit_program = "false".to_string();
        let sup = Arc::new(sup);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, VirbyError::Runtime(_)), "got {err}");
        assert!(!sup.is_running());
        assert!(!dir.path().join("vfkit.pid").exists());
        // The failed attempt must not latch shutdown: a retry is allowed.
        assert!(!sup.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_start_after_shutdown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ready_supervisor(dir.path()));
        sup.stop().await.unwrap();

        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("shutdown requested"));
    }

    #[tokio::test]
    async fn test_request_shutdown_latches_without_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ready_supervisor(dir.path()));

        // The signal-hook path: latch only, no process teardown involved.
        sup.request_shutdown();
        assert!(sup.is_shutdown_requested());

        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("shutdown requested"));
        let err = sup.safe_resume_or_start().await.unwrap_err();
        assert!(err.to_string().contains("shutdown requested"));
    }

    #[tokio::test]
    async fn test_ssh_failure_is_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ready_supervisor(dir.path());
        // Flip the prober so every attempt fails; discovery still succeeds.
        sup.prober = SshProber::new(dir.path()).with_program("false");
        let sup = Arc::new(sup);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, VirbyError::SshConnectivity(_)), "got {err}");
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn test_monitor_clears_state_on_external_death() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(ready_supervisor(dir.path()));
        sup.start().await.unwrap();
        let pid = sup.state.lock().await.pid.unwrap();

        // Kill the child behind the supervisor's back.
        signal_process_group(pid, libc::SIGKILL);

        let mut exit_rx = sup.state.lock().await.exit_rx.clone().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*exit_rx.borrow_and_update() {
                exit_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("monitor should observe the death");

        assert!(!sup.is_running());
        assert_eq!(sup.ip_address().await, None);
        // A fresh start is now permitted.
        let ip = sup.start().await.unwrap();
        assert_eq!(ip, "192.168.64.7");
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_resume_running_uses_cached_ip() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, hits) = spawn_control_plane(
            r#"{"state": "VirtualMachineStateRunning", "canPause": true}"#,
        )
        .await;
        let mut sup = ready_supervisor(dir.path());
        sup.api_base_url = base_url;
        let sup = Arc::new(sup);
        sup.start().await.unwrap();
        let pid_before = sup.state.lock().await.pid;

        let ip = sup.safe_resume_or_start().await.unwrap();
        assert_eq!(ip, "192.168.64.7");
        // One state query, no restart.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state.lock().await.pid, pid_before);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_resume_resumes_paused_vm() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, hits) = spawn_control_plane(
            r#"{"state": "VirtualMachineStatePaused", "canResume": true}"#,
        )
        .await;
        let mut sup = ready_supervisor(dir.path());
        sup.api_base_url = base_url;
        let sup = Arc::new(sup);
        sup.start().await.unwrap();

        let ip = sup.safe_resume_or_start().await.unwrap();
        assert_eq!(ip, "192.168.64.7");
        // Outer state query, resume precondition query, resume POST.
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(sup.is_running());

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_resume_rejects_transitional_state() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, _) =
            spawn_control_plane(r#"{"state": "VirtualMachineStateStopping"}"#).await;
        let mut sup = ready_supervisor(dir.path());
        sup.api_base_url = base_url;
        let sup = Arc::new(sup);
        sup.start().await.unwrap();

        let err = sup.safe_resume_or_start().await.unwrap_err();
        assert!(err.to_string().contains("rejecting connection"), "got {err}");
        // The VM itself is untouched.
        assert!(sup.is_running());

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_pause_or_stop_pauses_when_possible() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, _) = spawn_control_plane(
            r#"{"state": "VirtualMachineStateRunning", "canPause": true}"#,
        )
        .await;
        let mut sup = ready_supervisor(dir.path());
        sup.api_base_url = base_url;
        let sup = Arc::new(sup);
        sup.start().await.unwrap();

        let outcome = sup.safe_pause_or_stop().await.unwrap();
        assert_eq!(outcome, PauseOutcome::Paused);
        // Paused, not stopped: the process stays up for a later resume.
        assert!(sup.is_running());
        assert!(!sup.is_shutdown_requested());

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_pause_or_stop_stops_when_pause_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = ready_supervisor(dir.path());
        // Nothing answers on the control plane port.
        sup.api_base_url = "http://127.0.0.1:1".to_string();
        let sup = Arc::new(sup);
        sup.start().await.unwrap();

        // No control plane is listening: the precondition probe fails and
        // the fallback is a latching stop.
        let outcome = sup.safe_pause_or_stop().await.unwrap();
        assert_eq!(outcome, PauseOutcome::Stopped);
        assert!(!sup.is_running());
        assert!(sup.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_mac_is_locally_administered_unicast() {
        let mac = generate_mac_address();
        assert!(mac.starts_with("02:94:"));
        assert_eq!(mac.len(), 17);

        let dir = tempfile::tempdir().unwrap();
        let sup = VmSupervisor::with_working_dir(test_config(), dir.path().to_path_buf()).unwrap();
        // Regenerated only on supervisor construction, stable afterwards.
        assert_eq!(sup.mac_address(), sup.mac_address());
    }

    #[tokio::test]
    async fn test_missing_working_directory_is_startup_error() {
        let err = VmSupervisor::with_working_dir(
            test_config(),
            PathBuf::from("/nonexistent/virby-work"),
        )
        .unwrap_err();
        assert!(matches!(err, VirbyError::Startup(_)), "got {err}");
    }
}
