//! Circuit breaker decorating an [`Upstream`].
//!
//! ```text
//! Closed --[threshold consecutive failures]--> Open
//! Open --[cool-down elapsed, next call]--> HalfOpen (one probe admitted)
//! HalfOpen --[probe succeeds]--> Closed
//! HalfOpen --[probe fails]--> Open (cool-down restarts)
//! ```
//!
//! All operations share one breaker: a failure on any endpoint counts toward the same threshold.
//! Only [`UpstreamError::Client`] outcomes count as failures. A call that never reached the
//! upstream because the scrape deadline had passed leaves the state untouched.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use prometheus::IntGauge;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::deadline::Deadline;
use crate::models::tado::{HomeId, HomeState, User, Weather, Zone, ZoneStates};
use crate::upstream::{Upstream, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Encoding used by `tado_exporter_circuit_breaker_state`.
    pub fn as_gauge_value(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped on every transition; outcomes of calls admitted under an older value are stale.
    generation: u64,
    last_transition: Instant,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pass,
    Probe,
}

/// Handed out by `admit` and returned to `record` with the call's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    admission: Admission,
    generation: u64,
}

pub struct CircuitBreaker<U> {
    upstream: U,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    state_gauge: Option<IntGauge>,
}

impl<U: Upstream> CircuitBreaker<U> {
    pub fn new(upstream: U, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            upstream,
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                generation: 0,
                last_transition: Instant::now(),
                last_error: None,
                last_error_time: None,
            }),
            state_gauge: None,
        }
    }

    /// Mirror every state transition into `gauge`.
    pub fn with_state_gauge(mut self, gauge: IntGauge) -> Self {
        gauge.set(self.state().as_gauge_value());
        self.state_gauge = Some(gauge);
        self
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Message of the most recent error returned through the breaker, including rejections.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn last_error_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_error_time
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        let held_for = inner.last_transition.elapsed().as_secs_f64();
        inner.state = to;
        inner.generation = inner.generation.wrapping_add(1);
        inner.probe_in_flight = false;
        inner.last_transition = Instant::now();
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(
                    "Circuit breaker {:?} -> Open after {:.1}s and {} consecutive failure(s); \
                     pausing upstream calls for {}s",
                    from,
                    held_for,
                    inner.consecutive_failures,
                    self.config.cooldown.as_secs_f64()
                );
            }
            CircuitState::HalfOpen => info!(
                "Circuit breaker Open -> HalfOpen after {:.1}s; admitting one probe call",
                held_for
            ),
            CircuitState::Closed => {
                inner.opened_at = None;
                info!("Circuit breaker {:?} -> Closed after {:.1}s", from, held_for);
            }
        }
        if let Some(gauge) = &self.state_gauge {
            gauge.set(to.as_gauge_value());
        }
    }

    fn admit(&self) -> Result<Ticket, UpstreamError> {
        let mut inner = self.lock();
        let admission = match inner.state {
            CircuitState::Closed => Admission::Pass,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or(self.config.cooldown);
                if elapsed < self.config.cooldown {
                    return Err(UpstreamError::CircuitOpen {
                        retry_in: self.config.cooldown - elapsed,
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
                Admission::Probe
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Admission::Probe
            }
            CircuitState::HalfOpen => return Err(UpstreamError::CircuitOpen { retry_in: Duration::ZERO }),
        };
        Ok(Ticket {
            admission,
            generation: inner.generation,
        })
    }

    /// Outcomes of calls admitted before the latest transition only update the last-error
    /// bookkeeping; they never move the state.
    fn record<T>(&self, ticket: Ticket, result: &Result<T, UpstreamError>) {
        let mut inner = self.lock();
        if let Err(e) = result {
            Self::note_error(&mut inner, e);
        }
        if ticket.generation != inner.generation {
            debug!(
                "Ignoring outcome of a call admitted before the breaker moved to {:?}",
                inner.state
            );
            return;
        }
        if ticket.admission == Admission::Probe {
            inner.probe_in_flight = false;
        }
        match result {
            Ok(_) => {
                inner.consecutive_failures = 0;
                self.transition(&mut inner, CircuitState::Closed);
            }
            Err(e) if e.is_upstream_failure() => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                let trips = match inner.state {
                    CircuitState::HalfOpen => true,
                    CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
                    CircuitState::Open => false,
                };
                if trips {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            Err(_) => {}
        }
    }

    fn note_error(inner: &mut BreakerInner, e: &UpstreamError) {
        inner.last_error = Some(e.to_string());
        inner.last_error_time = Some(Utc::now());
    }

    fn call<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&U) -> Result<T, UpstreamError>,
    ) -> Result<T, UpstreamError> {
        let ticket = match self.admit() {
            Ok(ticket) => ticket,
            Err(rejected) => {
                debug!("Circuit breaker rejected {}: {}", op, rejected);
                Self::note_error(&mut self.lock(), &rejected);
                return Err(rejected);
            }
        };
        let result = f(&self.upstream);
        self.record(ticket, &result);
        result
    }
}

impl<U: Upstream> Upstream for CircuitBreaker<U> {
    fn get_me(&self, deadline: &Deadline) -> Result<User, UpstreamError> {
        self.call("get_me", |u| u.get_me(deadline))
    }

    fn get_home_state(&self, home_id: HomeId, deadline: &Deadline) -> Result<HomeState, UpstreamError> {
        self.call("get_home_state", |u| u.get_home_state(home_id, deadline))
    }

    fn get_zones(&self, home_id: HomeId, deadline: &Deadline) -> Result<Vec<Zone>, UpstreamError> {
        self.call("get_zones", |u| u.get_zones(home_id, deadline))
    }

    fn get_zone_states(&self, home_id: HomeId, deadline: &Deadline) -> Result<ZoneStates, UpstreamError> {
        self.call("get_zone_states", |u| u.get_zone_states(home_id, deadline))
    }

    fn get_weather(&self, home_id: HomeId, deadline: &Deadline) -> Result<Weather, UpstreamError> {
        self.call("get_weather", |u| u.get_weather(home_id, deadline))
    }
}
