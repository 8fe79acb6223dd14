// Outbound rate limiting against provider quotas
//
// One sliding window per key. Every admitted call holds a unit of capacity
// for exactly one window, so no trailing window ever admits more than
// `capacity` calls. Provider usage headers can only shrink what is left.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ProvidersConfig, RateLimitConfig, RateLimitScope};
use crate::error::GatewayError;
use crate::provider::{Provider, ProviderUsage, MAX_RETRY_HINT};

/// `at + by` that never panics. Spans too long to represent are shortened to
/// [`MAX_RETRY_HINT`].
fn offset(at: Instant, by: Duration) -> Instant {
    at.checked_add(by)
        .or_else(|| at.checked_add(MAX_RETRY_HINT))
        .unwrap_or(at)
}

/// Window key. `organization_id` is `None` when the quota is shared by the
/// whole developer app.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LimitKey {
    organization_id: Option<String>,
    provider: Provider,
}

/// Admission log for one key.
struct Window {
    capacity: usize,
    window: Duration,
    /// Admission instants in ascending order. Entries after `now` are
    /// reservations made by waiting callers.
    admitted: VecDeque<Instant>,
    /// Set from a provider `Retry-After`; nothing is admitted before it.
    blocked_until: Option<Instant>,
}

impl Window {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1) as usize,
            window,
            admitted: VecDeque::new(),
            blocked_until: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.admitted.front() {
            if offset(front, self.window) <= now {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    /// Earliest instant at which one more call may be admitted.
    fn next_slot(&mut self, now: Instant) -> Instant {
        self.prune(now);
        let mut slot = now;
        let len = self.admitted.len();
        if len >= self.capacity {
            slot = slot.max(offset(self.admitted[len - self.capacity], self.window));
        }
        if let Some(until) = self.blocked_until {
            slot = slot.max(until);
        }
        slot
    }

    fn in_use(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.admitted.len()
    }

    /// Records `count` admissions at `now` without disturbing ordering.
    fn consume(&mut self, now: Instant, count: usize) {
        let at = self.admitted.partition_point(|&t| t <= now);
        for _ in 0..count {
            self.admitted.insert(at, now);
        }
    }
}

/// Per-key sliding-window limiter.
///
/// Windows are created lazily on first use and sized from the provider's
/// quota. State is in-memory only (resets on restart).
pub struct RateLimiter {
    windows: DashMap<LimitKey, Window>,
    scope: RateLimitScope,
    quotas: HashMap<Provider, (u32, Duration)>,
}

impl RateLimiter {
    pub fn new(scope: RateLimitScope) -> Self {
        let defaults = ProvidersConfig::default();
        Self {
            windows: DashMap::new(),
            scope,
            quotas: Provider::ALL
                .iter()
                .map(|&p| (p, defaults.quota(p)))
                .collect(),
        }
    }

    pub fn from_config(config: &RateLimitConfig, providers: &ProvidersConfig) -> Self {
        let mut limiter = Self::new(config.scope);
        for provider in Provider::ALL {
            limiter.quotas.insert(provider, providers.quota(provider));
        }
        limiter
    }

    /// Overrides the quota for one provider.
    pub fn with_quota(mut self, provider: Provider, capacity: u32, window: Duration) -> Self {
        self.quotas.insert(provider, (capacity, window));
        self
    }

    fn key(&self, organization_id: &str, provider: Provider) -> LimitKey {
        LimitKey {
            organization_id: match self.scope {
                RateLimitScope::Organization => Some(organization_id.to_string()),
                RateLimitScope::App => None,
            },
            provider,
        }
    }

    fn window(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> dashmap::mapref::one::RefMut<'_, LimitKey, Window> {
        let (capacity, window) = self
            .quotas
            .get(&provider)
            .copied()
            .unwrap_or_else(|| ProvidersConfig::default().quota(provider));
        self.windows
            .entry(self.key(organization_id, provider))
            .or_insert_with(|| Window::new(capacity, window))
    }

    /// Admits one call if capacity is available right now.
    pub fn try_acquire(&self, organization_id: &str, provider: Provider) -> bool {
        let now = Instant::now();
        let mut window = self.window(organization_id, provider);
        if window.next_slot(now) <= now {
            window.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Reserves the earliest admissible slot and waits for it.
    ///
    /// Fails immediately with `RateLimited` when that slot is more than
    /// `max_wait` away. A caller dropped while waiting keeps its reservation
    /// until the window slides past it.
    pub async fn acquire_blocking(
        &self,
        organization_id: &str,
        provider: Provider,
        max_wait: Duration,
    ) -> Result<(), GatewayError> {
        let now = Instant::now();
        let slot = {
            let mut window = self.window(organization_id, provider);
            let slot = window.next_slot(now);
            let wait = slot - now;
            if wait > max_wait {
                debug!(
                    organization_id = %organization_id,
                    provider = %provider,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit wait exceeds budget"
                );
                return Err(GatewayError::RateLimited { retry_after: wait });
            }
            window.admitted.push_back(slot);
            slot
        };

        if slot > now {
            debug!(
                organization_id = %organization_id,
                provider = %provider,
                wait_ms = (slot - now).as_millis() as u64,
                "Waiting for rate limit slot"
            );
            tokio::time::sleep_until(slot).await;
        }
        Ok(())
    }

    /// Applies provider-reported usage.
    ///
    /// Remaining capacity only ever moves down: reported consumption beyond
    /// what the local log holds is recorded as extra admissions, and a
    /// `Retry-After` blocks the key until it elapses.
    pub fn record_usage(&self, organization_id: &str, provider: Provider, usage: &ProviderUsage) {
        if usage.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut window = self.window(organization_id, provider);
        let capacity = window.capacity;

        let mut reported_used: Option<usize> = None;
        if let Some(remaining) = usage.remaining {
            reported_used = Some(capacity.saturating_sub(remaining.min(capacity as u64) as usize));
        }
        if let Some(percent) = usage.used_percent {
            let used = ((capacity as f64) * percent.clamp(0.0, 100.0) / 100.0).ceil() as usize;
            reported_used = Some(reported_used.map_or(used, |u| u.max(used)));
        }
        if let Some(used) = reported_used {
            let local = window.in_use(now);
            if used > local {
                debug!(
                    organization_id = %organization_id,
                    provider = %provider,
                    local,
                    reported = used,
                    "Recalibrating rate limit from provider usage"
                );
                window.consume(now, used - local);
            }
        }

        if let Some(retry_after) = usage.retry_after {
            let retry_after = retry_after.min(MAX_RETRY_HINT);
            let until = offset(now, retry_after);
            if window.blocked_until.map_or(true, |current| current < until) {
                warn!(
                    organization_id = %organization_id,
                    provider = %provider,
                    retry_after_secs = retry_after.as_secs(),
                    "Provider requested back-off"
                );
                window.blocked_until = Some(until);
            }
        }
    }

    /// Calls that could be admitted right now.
    pub fn available(&self, organization_id: &str, provider: Provider) -> usize {
        let now = Instant::now();
        let mut window = self.window(organization_id, provider);
        if window.blocked_until.is_some_and(|until| until > now) {
            return 0;
        }
        let capacity = window.capacity;
        capacity.saturating_sub(window.in_use(now))
    }
}
