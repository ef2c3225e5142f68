//! The narrow seam between the collector and the Tado API.
//!
//! One trait call maps to one upstream round trip: no retries, no caching. The circuit breaker
//! and the test doubles implement the same trait, so the collector never knows which one it holds.

use core::fmt;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{TadoClient, TadoClientError};
use crate::deadline::Deadline;
use crate::models::tado::{HomeId, HomeState, User, Weather, Zone, ZoneStates};

#[derive(Debug)]
pub enum UpstreamError {
    /// The upstream was contacted and the call failed.
    Client(TadoClientError),
    /// The circuit breaker rejected the call without contacting the upstream.
    CircuitOpen { retry_in: Duration },
    /// The scrape's deadline had already passed; nothing was sent.
    DeadlineExceeded,
}

impl UpstreamError {
    /// Whether this outcome says something about upstream health.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(self, UpstreamError::Client(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, UpstreamError::CircuitOpen { .. })
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Client(e) => write!(f, "upstream error: {}", e),
            UpstreamError::CircuitOpen { retry_in } => write!(
                f,
                "upstream temporarily unavailable: circuit breaker open (next probe in {:.1}s)",
                retry_in.as_secs_f64()
            ),
            UpstreamError::DeadlineExceeded => write!(f, "scrape deadline exceeded"),
        }
    }
}

impl Error for UpstreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            UpstreamError::Client(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TadoClientError> for UpstreamError {
    fn from(value: TadoClientError) -> Self {
        UpstreamError::Client(value)
    }
}

/// Read-only operations the collector needs from the Tado API.
pub trait Upstream: Send + Sync {
    fn get_me(&self, deadline: &Deadline) -> Result<User, UpstreamError>;

    fn get_home_state(&self, home_id: HomeId, deadline: &Deadline) -> Result<HomeState, UpstreamError>;

    fn get_zones(&self, home_id: HomeId, deadline: &Deadline) -> Result<Vec<Zone>, UpstreamError>;

    fn get_zone_states(&self, home_id: HomeId, deadline: &Deadline) -> Result<ZoneStates, UpstreamError>;

    fn get_weather(&self, home_id: HomeId, deadline: &Deadline) -> Result<Weather, UpstreamError>;
}

impl<U: Upstream + ?Sized> Upstream for Arc<U> {
    fn get_me(&self, deadline: &Deadline) -> Result<User, UpstreamError> {
        (**self).get_me(deadline)
    }

    fn get_home_state(&self, home_id: HomeId, deadline: &Deadline) -> Result<HomeState, UpstreamError> {
        (**self).get_home_state(home_id, deadline)
    }

    fn get_zones(&self, home_id: HomeId, deadline: &Deadline) -> Result<Vec<Zone>, UpstreamError> {
        (**self).get_zones(home_id, deadline)
    }

    fn get_zone_states(&self, home_id: HomeId, deadline: &Deadline) -> Result<ZoneStates, UpstreamError> {
        (**self).get_zone_states(home_id, deadline)
    }

    fn get_weather(&self, home_id: HomeId, deadline: &Deadline) -> Result<Weather, UpstreamError> {
        (**self).get_weather(home_id, deadline)
    }
}

fn budget(deadline: &Deadline) -> Result<Duration, UpstreamError> {
    deadline.remaining().ok_or(UpstreamError::DeadlineExceeded)
}

/// A budget that ran out inside the client (say, during a token refresh) is still a deadline
/// expiry for the request that was never sent.
fn adapt<T>(result: Result<T, TadoClientError>) -> Result<T, UpstreamError> {
    result.map_err(|e| match e {
        TadoClientError::BudgetSpent(_) => UpstreamError::DeadlineExceeded,
        e => UpstreamError::Client(e),
    })
}

impl Upstream for TadoClient {
    fn get_me(&self, deadline: &Deadline) -> Result<User, UpstreamError> {
        adapt(TadoClient::get_me(self, budget(deadline)?))
    }

    fn get_home_state(&self, home_id: HomeId, deadline: &Deadline) -> Result<HomeState, UpstreamError> {
        adapt(TadoClient::get_home_state(self, home_id, budget(deadline)?))
    }

    fn get_zones(&self, home_id: HomeId, deadline: &Deadline) -> Result<Vec<Zone>, UpstreamError> {
        adapt(TadoClient::get_zones(self, home_id, budget(deadline)?))
    }

    fn get_zone_states(&self, home_id: HomeId, deadline: &Deadline) -> Result<ZoneStates, UpstreamError> {
        adapt(TadoClient::get_zone_states(self, home_id, budget(deadline)?))
    }

    fn get_weather(&self, home_id: HomeId, deadline: &Deadline) -> Result<Weather, UpstreamError> {
        adapt(TadoClient::get_weather(self, home_id, budget(deadline)?))
    }
}

#[cfg(test)]
pub mod fake {
    //! Scripted in-memory upstream shared by the breaker and collector tests.

    use super::*;
    use crate::models::tado::{ZoneId, ZoneState};
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Op {
        Me,
        HomeState,
        Zones,
        ZoneStates,
        Weather,
    }

    #[derive(Debug, Clone, Default)]
    pub struct FakeHome {
        pub state: HomeState,
        pub weather: Weather,
        pub zones: Vec<Zone>,
        pub zone_states: BTreeMap<ZoneId, ZoneState>,
    }

    #[derive(Default)]
    pub struct FakeUpstream {
        pub me: Mutex<User>,
        pub homes: Mutex<BTreeMap<HomeId, FakeHome>>,
        failing: Mutex<HashSet<(Op, Option<HomeId>)>>,
        calls: AtomicUsize,
    }

    impl FakeUpstream {
        pub fn with_homes(homes: Vec<(HomeId, FakeHome)>) -> Self {
            let me = User {
                id: Some("user-1".into()),
                homes: Some(
                    homes
                        .iter()
                        .map(|(id, _)| crate::models::tado::HomeBase {
                            id: Some(*id),
                            name: Some(format!("Home {}", id.0)),
                        })
                        .collect(),
                ),
                ..Default::default()
            };
            FakeUpstream {
                me: Mutex::new(me),
                homes: Mutex::new(homes.into_iter().collect()),
                ..Default::default()
            }
        }

        /// Make `op` fail; `None` fails it for every home.
        pub fn fail(&self, op: Op, home_id: Option<HomeId>) {
            self.failing.lock().unwrap().insert((op, home_id));
        }

        pub fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn enter(&self, op: Op, home_id: Option<HomeId>, deadline: &Deadline) -> Result<(), UpstreamError> {
            if deadline.is_expired() {
                return Err(UpstreamError::DeadlineExceeded);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing.lock().unwrap();
            if failing.contains(&(op, None)) || failing.contains(&(op, home_id)) {
                return Err(UpstreamError::Client(TadoClientError::Http {
                    status: 503,
                    message: format!("{:?} unavailable", op),
                }));
            }
            Ok(())
        }

        fn home<T>(&self, home_id: HomeId, f: impl FnOnce(&FakeHome) -> T) -> Result<T, UpstreamError> {
            let homes = self.homes.lock().unwrap();
            homes.get(&home_id).map(f).ok_or_else(|| {
                UpstreamError::Client(TadoClientError::Http {
                    status: 404,
                    message: format!("home {} not found", home_id.0),
                })
            })
        }
    }

    impl Upstream for FakeUpstream {
        fn get_me(&self, deadline: &Deadline) -> Result<User, UpstreamError> {
            self.enter(Op::Me, None, deadline)?;
            Ok(self.me.lock().unwrap().clone())
        }

        fn get_home_state(&self, home_id: HomeId, deadline: &Deadline) -> Result<HomeState, UpstreamError> {
            self.enter(Op::HomeState, Some(home_id), deadline)?;
            self.home(home_id, |h| h.state.clone())
        }

        fn get_zones(&self, home_id: HomeId, deadline: &Deadline) -> Result<Vec<Zone>, UpstreamError> {
            self.enter(Op::Zones, Some(home_id), deadline)?;
            self.home(home_id, |h| h.zones.clone())
        }

        fn get_zone_states(&self, home_id: HomeId, deadline: &Deadline) -> Result<ZoneStates, UpstreamError> {
            self.enter(Op::ZoneStates, Some(home_id), deadline)?;
            self.home(home_id, |h| ZoneStates {
                zone_states: Some(
                    h.zone_states
                        .iter()
                        .map(|(id, state)| (id.0.to_string(), state.clone()))
                        .collect(),
                ),
            })
        }

        fn get_weather(&self, home_id: HomeId, deadline: &Deadline) -> Result<Weather, UpstreamError> {
            self.enter(Op::Weather, Some(home_id), deadline)?;
            self.home(home_id, |h| h.weather.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_short_circuits_the_client_adapter() {
        let client = TadoClient::new("refresh", "143.0");
        let deadline = Deadline::after(Duration::ZERO);
        let err = Upstream::get_me(&client, &deadline).unwrap_err();
        assert!(matches!(err, UpstreamError::DeadlineExceeded));
        assert!(!err.is_upstream_failure());
    }

    #[test]
    fn classifies_error_kinds() {
        let client = UpstreamError::from(TadoClientError::Transport("connection refused".into()));
        assert!(client.is_upstream_failure());
        assert!(!client.is_circuit_open());

        let open = UpstreamError::CircuitOpen {
            retry_in: Duration::from_secs(3),
        };
        assert!(open.is_circuit_open());
        assert!(!open.is_upstream_failure());
        assert!(open.to_string().contains("temporarily unavailable"));
    }

    #[test]
    fn budget_spent_inside_the_client_is_a_deadline_expiry() {
        let spent = adapt::<()>(Err(TadoClientError::BudgetSpent(Duration::from_secs(10)))).unwrap_err();
        assert!(matches!(spent, UpstreamError::DeadlineExceeded));
        assert!(!spent.is_upstream_failure());

        let timed_out = adapt::<()>(Err(TadoClientError::Timeout("read timed out".into()))).unwrap_err();
        assert!(timed_out.is_upstream_failure());
    }
}
