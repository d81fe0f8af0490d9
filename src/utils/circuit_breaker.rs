use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Sits in front of the broker sink so a dead broker costs callers one fast
// failure instead of a full ack timeout each.
//
// States:
// - Closed: calls pass through, consecutive failures are counted
// - Open: calls are refused until the cool-down elapses
// - HalfOpen: calls pass; enough successes close, one failure re-opens
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Encoding used by the circuit state gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

pub type TransitionObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    state: Arc<Mutex<CircuitBreakerState>>,
    config: CircuitBreakerConfig,
    observer: Option<TransitionObserver>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Cool-down before a half-open probe is allowed
    pub timeout: Duration,
    /// Half-open successes needed to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            config,
            observer: None,
        }
    }

    /// Called with (from, to) after every state change
    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run `operation` if the circuit allows it and record the outcome
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match operation.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let transition = {
            let mut state = self.state.lock().await;
            match (state.state, state.opened_at) {
                (CircuitState::Open, Some(opened_at)) if opened_at.elapsed() >= self.config.timeout => {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    Some((CircuitState::Open, CircuitState::HalfOpen))
                }
                (CircuitState::Open, _) => return Err(CircuitBreakerError::CircuitOpen),
                _ => None,
            }
        };

        self.notify(transition);
        Ok(())
    }

    async fn record_success(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            match state.state {
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        state.state = CircuitState::Closed;
                        state.failure_count = 0;
                        state.success_count = 0;
                        state.opened_at = None;
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    state.failure_count = 0;
                    None
                }
                // A call admitted before another caller tripped the circuit
                CircuitState::Open => None,
            }
        };

        self.notify(transition);
    }

    async fn record_failure(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            state.failure_count += 1;

            match state.state {
                CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    Some((CircuitState::Closed, CircuitState::Open))
                }
                CircuitState::HalfOpen => {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    state.success_count = 0;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                _ => None,
            }
        };

        self.notify(transition);
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, from = from.as_str(), "Circuit breaker opened")
            }
            _ => tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state changed"
            ),
        }

        if let Some(observer) = &self.observer {
            observer(from, to);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn get_failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "Circuit breaker is open"),
            CircuitBreakerError::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::error::Error> std::error::Error for CircuitBreakerError<E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn breaker(failure_threshold: u32, timeout: Duration, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                timeout,
                success_threshold,
            },
        )
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(30), 2);

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), _>("broker down") }).await;
            assert!(matches!(result, Err(CircuitBreakerError::OperationFailed(_))));
        }
        assert_eq!(cb.get_state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let cb = breaker(3, Duration::from_secs(30), 2);

        let _ = cb.call(async { Err::<(), _>("e") }).await;
        let _ = cb.call(async { Err::<(), _>("e") }).await;
        let _ = cb.call(async { Ok::<_, &str>(()) }).await;
        let _ = cb.call(async { Err::<(), _>("e") }).await;

        assert_eq!(cb.get_state().await, CircuitState::Closed);
        assert_eq!(cb.get_failure_count().await, 1);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_and_reports_transitions() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let cb = breaker(2, Duration::from_millis(50), 1).with_observer(Arc::new(move |from: CircuitState, to: CircuitState| {
            seen_clone.lock().unwrap().push((from, to));
        }));

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>("e") }).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cb.call(async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(cb.get_state().await, CircuitState::Closed);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(20), 3);

        let _ = cb.call(async { Err::<(), _>("e") }).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let _ = cb.call(async { Err::<(), _>("still down") }).await;

        assert_eq!(cb.get_state().await, CircuitState::Open);
    }
}
