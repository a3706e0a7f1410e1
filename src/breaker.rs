use std::future::Future;

use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::VirbyError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation: calls pass through.
    Closed,
    /// Failing: calls are rejected without invoking the inner operation.
    Open,
    /// Recovery probe: a single trial call is allowed through.
    HalfOpen,
}

/// Failure isolation for the hypervisor control plane.
///
/// Retry composes *inside* `call`: the operation passed in performs its own
/// transient retries, so the breaker observes one failure per exhausted call
/// rather than one per attempt.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            failure_count: 0,
            last_failure_time: None,
            state: CircuitState::Closed,
        }
    }

    /// Execute `op` under the breaker.
    ///
    /// Open circuit: rejects immediately with a Runtime error. After the
    /// recovery timeout has elapsed since the last failure, the next call is
    /// allowed through as a half-open trial; its outcome closes or reopens
    /// the circuit.
    pub async fn call<T, F, Fut>(&mut self, op: F) -> Result<T, VirbyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, VirbyError>>,
    {
        if self.state == CircuitState::Open {
            let cooled_down = self
                .last_failure_time
                .is_none_or(|t| t.elapsed() >= self.timeout);
            if cooled_down {
                debug!("circuit breaker half-open, allowing trial call");
                self.state = CircuitState::HalfOpen;
            } else {
                return Err(VirbyError::Runtime("circuit breaker is open".into()));
            }
        }

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    fn on_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    fn on_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());

        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            if self.state != CircuitState::Open {
                warn!(
                    failures = self.failure_count,
                    "circuit breaker opened"
                );
            }
            self.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(10))
    }

    async fn fail(b: &mut CircuitBreaker, calls: &Cell<u32>) -> Result<(), VirbyError> {
        b.call(|| {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(VirbyError::Runtime("boom".into())) }
        })
        .await
    }

    async fn succeed(b: &mut CircuitBreaker, calls: &Cell<u32>) -> Result<u32, VirbyError> {
        b.call(|| {
            calls.set(calls.get() + 1);
            async { Ok(7) }
        })
        .await
    }

    #[tokio::test]
    async fn test_closed_passes_through() {
        let mut b = breaker();
        let calls = Cell::new(0);
        assert_eq!(succeed(&mut b, &calls).await.unwrap(), 7);
        assert_eq!(calls.get(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let mut b = breaker();
        let calls = Cell::new(0);
        for _ in 0..3 {
            fail(&mut b, &calls).await.unwrap_err();
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(calls.get(), 3);

        // Rejected without invoking the inner operation.
        let err = fail(&mut b, &calls).await.unwrap_err();
        assert!(err.to_string().contains("circuit breaker is open"));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let mut b = breaker();
        let calls = Cell::new(0);
        fail(&mut b, &calls).await.unwrap_err();
        fail(&mut b, &calls).await.unwrap_err();
        succeed(&mut b, &calls).await.unwrap();

        // Two more failures do not reach the threshold of three.
        fail(&mut b, &calls).await.unwrap_err();
        fail(&mut b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_after_timeout() {
        let mut b = breaker();
        let calls = Cell::new(0);
        for _ in 0..3 {
            fail(&mut b, &calls).await.unwrap_err();
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;

        // First call after the cool-down is the half-open trial and reaches
        // the inner operation.
        assert_eq!(succeed(&mut b, &calls).await.unwrap(), 7);
        assert_eq!(calls.get(), 4);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let mut b = breaker();
        let calls = Cell::new(0);
        for _ in 0..3 {
            fail(&mut b, &calls).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        // Trial fails: straight back to open, next call rejected unseen.
        fail(&mut b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        let before = calls.get();
        fail(&mut b, &calls).await.unwrap_err();
        assert_eq!(calls.get(), before);
    }
}
