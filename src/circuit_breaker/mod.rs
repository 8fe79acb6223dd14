// Per-provider circuit breaker
//
// Closed -> Open after `failure_threshold` consecutive failures inside the
// evaluation window. Open -> HalfOpen once `reset_timeout` has elapsed, which
// admits exactly one trial call. The trial decides: success closes the
// circuit, failure reopens it with the reset timeout doubled (capped).
//
// Only provider-side faults (5xx, timeouts, connection errors) are failures.
// 4xx and 429 are neutral.

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::GatewayError;
use crate::provider::Provider;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Identifies one circuit. `organization_id` is only set when circuits are
/// isolated per organization.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub provider: Provider,
    pub organization_id: Option<String>,
}

impl CircuitKey {
    pub fn provider(provider: Provider) -> Self {
        Self {
            provider,
            organization_id: None,
        }
    }
}

/// How a guarded call ended, from the breaker's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    Neutral,
}

impl CallOutcome {
    /// `ProviderUnavailable`, `Transient` and `DeadlineExceeded` errors are
    /// failures. Any other error is neutral.
    pub fn classify<T>(result: &Result<T, GatewayError>) -> Self {
        match result {
            Ok(_) => CallOutcome::Success,
            Err(
                GatewayError::ProviderUnavailable { .. }
                | GatewayError::Transient(_)
                | GatewayError::DeadlineExceeded,
            ) => CallOutcome::Failure,
            Err(_) => CallOutcome::Neutral,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Settings {
    failure_threshold: u32,
    evaluation_window: Duration,
    reset_timeout: Duration,
    max_reset_timeout: Duration,
}

struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    reset_timeout: Duration,
    trial_in_flight: bool,
}

impl Circuit {
    fn new(settings: &Settings) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            opened_at: None,
            reset_timeout: settings.reset_timeout,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

/// Point-in-time view of one circuit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub reset_timeout: Duration,
    /// Time until an open circuit admits its trial call.
    pub retry_in: Option<Duration>,
}

type Circuits = DashMap<CircuitKey, Circuit>;

pub struct CircuitBreaker {
    circuits: Arc<Circuits>,
    settings: Settings,
    per_organization: bool,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            circuits: Arc::new(DashMap::new()),
            settings: Settings {
                failure_threshold: config.failure_threshold.max(1),
                evaluation_window: config.evaluation_window(),
                reset_timeout: config.reset_timeout(),
                max_reset_timeout: config.max_reset_timeout().max(config.reset_timeout()),
            },
            per_organization: config.per_organization,
        }
    }

    /// Circuit key for a call made on behalf of `organization_id`.
    pub fn key(&self, organization_id: &str, provider: Provider) -> CircuitKey {
        CircuitKey {
            provider,
            organization_id: self
                .per_organization
                .then(|| organization_id.to_string()),
        }
    }

    /// Asks permission for one call.
    ///
    /// Returns `CircuitOpen` while the circuit is open or while a half-open
    /// trial is already in flight.
    pub fn acquire(&self, key: &CircuitKey) -> Result<CallPermit, GatewayError> {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(key.clone())
            .or_insert_with(|| Circuit::new(&self.settings));

        let trial = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = circuit.opened_at.unwrap_or(now);
                if now < opened_at + circuit.reset_timeout {
                    return Err(GatewayError::CircuitOpen {
                        provider: key.provider,
                    });
                }
                info!(provider = %key.provider, "Circuit half-open, admitting trial call");
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    return Err(GatewayError::CircuitOpen {
                        provider: key.provider,
                    });
                }
                circuit.trial_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            circuits: self.circuits.clone(),
            settings: self.settings,
            key: key.clone(),
            trial,
            reported: false,
        })
    }

    /// Runs `call` under the breaker, reporting per [`CallOutcome::classify`].
    pub async fn execute<T, F, Fut>(&self, key: &CircuitKey, call: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let permit = self.acquire(key)?;
        let result = call().await;
        permit.report_outcome(CallOutcome::classify(&result));
        result
    }

    pub fn snapshot(&self, key: &CircuitKey) -> CircuitSnapshot {
        let now = Instant::now();
        match self.circuits.get(key) {
            Some(circuit) => CircuitSnapshot {
                state: circuit.state,
                consecutive_failures: circuit.consecutive_failures,
                reset_timeout: circuit.reset_timeout,
                retry_in: match (circuit.state, circuit.opened_at) {
                    (CircuitState::Open, Some(opened_at)) => {
                        Some((opened_at + circuit.reset_timeout).saturating_duration_since(now))
                    }
                    _ => None,
                },
            },
            None => CircuitSnapshot {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                reset_timeout: self.settings.reset_timeout,
                retry_in: None,
            },
        }
    }
}

/// Permission for one call. Report the outcome with [`CallPermit::success`],
/// [`CallPermit::failure`] or [`CallPermit::neutral`]; dropping it unreported
/// counts as neutral.
pub struct CallPermit {
    circuits: Arc<Circuits>,
    settings: Settings,
    key: CircuitKey,
    trial: bool,
    reported: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.report(CallOutcome::Success);
    }

    pub fn failure(mut self) {
        self.report(CallOutcome::Failure);
    }

    pub fn neutral(mut self) {
        self.report(CallOutcome::Neutral);
    }

    pub fn report_outcome(mut self, outcome: CallOutcome) {
        self.report(outcome);
    }

    fn report(&mut self, outcome: CallOutcome) {
        if self.reported {
            return;
        }
        self.reported = true;

        let Some(mut circuit) = self.circuits.get_mut(&self.key) else {
            return;
        };
        let now = Instant::now();
        let provider = self.key.provider;

        if self.trial {
            match outcome {
                CallOutcome::Success => {
                    info!(provider = %provider, "Circuit closed after successful trial");
                    circuit.state = CircuitState::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.first_failure_at = None;
                    circuit.opened_at = None;
                    circuit.reset_timeout = self.settings.reset_timeout;
                    circuit.trial_in_flight = false;
                }
                CallOutcome::Failure => {
                    circuit.reset_timeout =
                        (circuit.reset_timeout * 2).min(self.settings.max_reset_timeout);
                    warn!(
                        provider = %provider,
                        reset_timeout_secs = circuit.reset_timeout.as_secs(),
                        "Circuit trial failed, reopening"
                    );
                    circuit.open(now);
                }
                CallOutcome::Neutral => {
                    circuit.trial_in_flight = false;
                }
            }
            return;
        }

        // Calls admitted while closed that finish after the circuit moved on
        // do not influence it.
        if circuit.state != CircuitState::Closed {
            return;
        }
        match outcome {
            CallOutcome::Success => {
                circuit.consecutive_failures = 0;
                circuit.first_failure_at = None;
            }
            CallOutcome::Failure => {
                let in_window = circuit
                    .first_failure_at
                    .is_some_and(|first| now.duration_since(first) <= self.settings.evaluation_window);
                if in_window {
                    circuit.consecutive_failures += 1;
                } else {
                    circuit.first_failure_at = Some(now);
                    circuit.consecutive_failures = 1;
                }
                if circuit.consecutive_failures >= self.settings.failure_threshold {
                    warn!(
                        provider = %provider,
                        failures = circuit.consecutive_failures,
                        "Circuit opened"
                    );
                    circuit.open(now);
                }
            }
            CallOutcome::Neutral => {}
        }
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.report(CallOutcome::Neutral);
    }
}
