use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::error::VirbyError;

/// Retries per API call on transient connect/timeout errors.
const MAX_RETRIES: u32 = 2;
/// Base delay for retry backoff; doubled per attempt plus up to 100 ms jitter.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Breaker settings for the hypervisor control plane.
const FAILURE_THRESHOLD: u32 = 3;
const BREAKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Virtual machine states reported by vfkit's RESTful API.
///
/// The wire literals are vfkit's, bit-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    #[serde(rename = "VirtualMachineStateRunning")]
    Running,
    #[serde(rename = "VirtualMachineStateStopped")]
    Stopped,
    #[serde(rename = "VirtualMachineStatePaused")]
    Paused,
    #[serde(rename = "VirtualMachineStateError")]
    Error,
    #[serde(rename = "VirtualMachineStateStarting")]
    Starting,
    #[serde(rename = "VirtualMachineStatePausing")]
    Pausing,
    #[serde(rename = "VirtualMachineStateResuming")]
    Resuming,
    #[serde(rename = "VirtualMachineStateStopping")]
    Stopping,
    #[serde(rename = "VirtualMachineStateSaving")]
    Saving,
    #[serde(rename = "VirtualMachineStateRestoring")]
    Restoring,
}

/// Response shape of `GET /vm/state`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct VmStateResponse {
    pub state: VmState,
    #[serde(default, rename = "canPause")]
    pub can_pause: bool,
    #[serde(default, rename = "canResume")]
    pub can_resume: bool,
}

/// State transitions accepted by `POST /vm/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateChange {
    Pause,
    Resume,
}

#[derive(Serialize)]
struct StateChangeRequest {
    state: StateChange,
}

/// Client for vfkit's local HTTP control plane.
///
/// One pooled connection set per supervisor start; the supervisor drops the
/// client on Stop, which tears the pool down. Every request is gated on the
/// VM process being alive, retried on transient transport errors, and routed
/// through a circuit breaker.
#[derive(Debug)]
pub struct VfkitClient {
    base_url: String,
    client: reqwest::Client,
    breaker: Mutex<CircuitBreaker>,
    vm_running: Arc<AtomicBool>,
}

impl VfkitClient {
    pub fn new(api_port: u16, vm_running: Arc<AtomicBool>) -> Result<Self, VirbyError> {
        Self::with_base_url(format!("http://localhost:{api_port}"), vm_running)
    }

    pub(crate) fn with_base_url(
        base_url: String,
        vm_running: Arc<AtomicBool>,
    ) -> Result<Self, VirbyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(2)
            .http1_only()
            .build()
            .map_err(|e| VirbyError::Runtime(format!("failed to build vfkit API client: {e}")))?;

        Ok(Self {
            base_url,
            client,
            breaker: Mutex::new(CircuitBreaker::new(FAILURE_THRESHOLD, BREAKER_TIMEOUT)),
            vm_running,
        })
    }

    /// Query the current VM state.
    pub async fn vm_state(&self) -> Result<VmStateResponse, VirbyError> {
        let value = self
            .call_api(Method::GET, "/vm/state", None)
            .await?
            .ok_or_else(|| VirbyError::Runtime("empty response from GET /vm/state".into()))?;
        serde_json::from_value(value)
            .map_err(|e| VirbyError::Runtime(format!("unexpected /vm/state response: {e}")))
    }

    /// Request a Pause or Resume transition.
    pub async fn set_vm_state(&self, change: StateChange) -> Result<(), VirbyError> {
        let body = serde_json::to_value(StateChangeRequest { state: change })
            .map_err(|e| VirbyError::Runtime(format!("failed to encode state change: {e}")))?;
        self.call_api(Method::POST, "/vm/state", Some(body)).await?;
        Ok(())
    }

    async fn call_api(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, VirbyError> {
        if !self.vm_running.load(Ordering::SeqCst) {
            return Err(VirbyError::Runtime(
                "cannot make API request: VM is not running".into(),
            ));
        }

        // Holding the breaker across the request serialises control-plane
        // calls, which also gives half-open its single-trial semantics.
        let mut breaker = self.breaker.lock().await;
        breaker
            .call(|| self.request_with_retry(method, endpoint, body))
            .await
    }

    async fn request_with_retry(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, VirbyError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut attempt: u32 = 0;

        loop {
            let mut request = self.client.request(method.clone(), url.as_str());
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let response = response.error_for_status().map_err(|e| {
                        VirbyError::Runtime(format!("vfkit API request failed: {e}"))
                    })?;
                    let bytes = response.bytes().await.map_err(|e| {
                        VirbyError::Runtime(format!("failed to read vfkit API response: {e}"))
                    })?;
                    if bytes.is_empty() {
                        return Ok(None);
                    }
                    return Ok(serde_json::from_slice(&bytes).ok());
                }
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < MAX_RETRIES => {
                    let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    let jitter =
                        Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..0.1));
                    debug!(
                        attempt,
                        endpoint,
                        delay_ms = (backoff + jitter).as_millis() as u64,
                        error = %e,
                        "transient vfkit API error, retrying"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(VirbyError::Runtime(format!(
                        "vfkit API request failed: {e}"
                    )));
                }
            }
        }
    }
}
