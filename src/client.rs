//! Blocking HTTP client for the handful of Tado API endpoints the exporter reads.
//!
//! - Built on `ureq` (no async); every call takes the time budget it may spend, which becomes
//!   the request's global timeout.
//! - Authentication uses the OAuth refresh-token grant. The access token lives in memory only and
//!   is refreshed shortly before expiry, or once after an HTTP 401.
//! - The token sits behind a `Mutex`, so one client can serve concurrent scrapes.

use http::StatusCode;
use log::debug;
use serde::de::DeserializeOwned;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::models::tado::*;

const BASE_URL: &str = "https://my.tado.com/api/v2";
const OAUTH_TOKEN_URL: &str = "https://login.tado.com/oauth2/token";
const OAUTH_CLIENT_ID: &str = "1bb50063-6b0c-4d11-bd99-387f4a91cc46";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum TadoClientError {
    Transport(String),
    Timeout(String),
    /// The caller's budget ran out before the request could be sent.
    BudgetSpent(Duration),
    Http { status: u16, message: String },
    Json(serde_path_to_error::Error<serde_json::Error>),
    Auth(String),
}

impl core::fmt::Display for TadoClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TadoClientError::Transport(s) => write!(f, "transport error: {}", s),
            TadoClientError::Timeout(s) => write!(f, "timed out: {}", s),
            TadoClientError::BudgetSpent(budget) => write!(f, "request budget of {:?} spent before sending", budget),
            TadoClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            TadoClientError::Json(e) => write!(f, "json error at {}: {}", e.path(), e.inner()),
            TadoClientError::Auth(e) => write!(f, "auth error: {}", e),
        }
    }
}

impl std::error::Error for TadoClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TadoClientError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ureq::Error> for TadoClientError {
    fn from(value: ureq::Error) -> Self {
        match value {
            e @ ureq::Error::Timeout(_) => TadoClientError::Timeout(e.to_string()),
            e => TadoClientError::Transport(e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
struct OAuthToken {
    access_token: String,
    expires_at: Instant,
}

impl OAuthToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Debug)]
struct OAuthState {
    token: Option<OAuthToken>,
    refresh_token: String,
}

pub struct TadoClient {
    agent: ureq::Agent,
    user_agent: String,
    oauth: Mutex<OAuthState>,
}

impl TadoClient {
    /// The first access token is fetched lazily by the first API call, so a client can be built
    /// while the upstream is unreachable.
    pub fn new(refresh_token: impl Into<String>, firefox_version: &str) -> Self {
        let config = ureq::Agent::config_builder().http_status_as_error(false).build();
        TadoClient {
            agent: ureq::Agent::new_with_config(config),
            user_agent: format!(
                "Mozilla/5.0 (X11; Linux x86_64; rv:{v}) Gecko/20100101 Firefox/{v}",
                v = firefox_version
            ),
            oauth: Mutex::new(OAuthState {
                token: None,
                refresh_token: refresh_token.into(),
            }),
        }
    }

    fn url(path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", BASE_URL, path)
        } else {
            format!("{}/{}", BASE_URL, path)
        }
    }

    fn budget_left(started: Instant, budget: Duration) -> Result<Duration, TadoClientError> {
        budget
            .checked_sub(started.elapsed())
            .filter(|left| !left.is_zero())
            .ok_or(TadoClientError::BudgetSpent(budget))
    }

    fn refresh_grant(&self, state: &mut OAuthState, timeout: Duration) -> Result<String, TadoClientError> {
        #[derive(serde::Deserialize)]
        struct R {
            access_token: String,
            expires_in: u64,
            #[serde(default)]
            refresh_token: Option<String>,
        }

        let mut resp = self
            .agent
            .post(OAUTH_TOKEN_URL)
            .header("Accept", "application/json")
            .header("User-Agent", &self.user_agent)
            .config()
            .timeout_global(Some(timeout))
            .build()
            .send_form([
                ("client_id", OAUTH_CLIENT_ID),
                ("grant_type", "refresh_token"),
                ("refresh_token", state.refresh_token.as_str()),
            ])?;

        let status = resp.status();
        let body = resp.body_mut().read_to_string()?;
        if !status.is_success() {
            return Err(TadoClientError::Auth(format!("http {}: {}", status.as_u16(), body)));
        }
        let mut de = serde_json::Deserializer::from_str(&body);
        let R {
            access_token,
            expires_in,
            refresh_token,
        } = serde_path_to_error::deserialize(&mut de).map_err(TadoClientError::Json)?;

        // tado rotates refresh tokens; the old one stops working once a new one is issued
        if let Some(rotated) = refresh_token {
            state.refresh_token = rotated;
        }
        state.token = Some(OAuthToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        debug!("Refreshed Tado access token (expires in {}s)", expires_in);
        Ok(access_token)
    }

    fn bearer(&self, timeout: Duration, force_refresh: bool) -> Result<String, TadoClientError> {
        let mut state = self.oauth.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = state
            .token
            .as_ref()
            .filter(|t| !force_refresh && t.is_fresh())
            .map(|t| t.access_token.clone());
        match cached {
            Some(token) => Ok(token),
            None => self.refresh_grant(&mut state, timeout),
        }
    }

    fn send_get(
        &self,
        url: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<http::Response<ureq::Body>, TadoClientError> {
        Ok(self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("Authorization", &format!("Bearer {}", token))
            .config()
            .timeout_global(Some(timeout))
            .build()
            .call()?)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, timeout: Duration) -> Result<T, TadoClientError> {
        let started = Instant::now();
        let url = Self::url(path);

        let token = self.bearer(timeout, false)?;
        let mut resp = self.send_get(&url, &token, Self::budget_left(started, timeout)?)?;

        // retry once on 401 after forcing a refresh
        if resp.status() == StatusCode::UNAUTHORIZED {
            let token = self.bearer(Self::budget_left(started, timeout)?, true)?;
            resp = self.send_get(&url, &token, Self::budget_left(started, timeout)?)?;
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .body_mut()
                .read_to_string()
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(TadoClientError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.body_mut().read_to_string()?;
        let mut de = serde_json::Deserializer::from_str(&body);
        serde_path_to_error::deserialize(&mut de).map_err(TadoClientError::Json)
    }

    pub fn get_me(&self, timeout: Duration) -> Result<User, TadoClientError> {
        self.get_json("/me", timeout)
    }

    pub fn get_home_state(&self, home_id: HomeId, timeout: Duration) -> Result<HomeState, TadoClientError> {
        self.get_json(&format!("/homes/{}/state", home_id.0), timeout)
    }

    pub fn get_weather(&self, home_id: HomeId, timeout: Duration) -> Result<Weather, TadoClientError> {
        self.get_json(&format!("/homes/{}/weather", home_id.0), timeout)
    }

    pub fn get_zones(&self, home_id: HomeId, timeout: Duration) -> Result<Vec<Zone>, TadoClientError> {
        self.get_json(&format!("/homes/{}/zones", home_id.0), timeout)
    }

    pub fn get_zone_states(&self, home_id: HomeId, timeout: Duration) -> Result<ZoneStates, TadoClientError> {
        self.get_json(&format!("/homes/{}/zoneStates", home_id.0), timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_paths_with_and_without_slash() {
        assert_eq!(TadoClient::url("/me"), "https://my.tado.com/api/v2/me");
        assert_eq!(TadoClient::url("homes/1/state"), "https://my.tado.com/api/v2/homes/1/state");
    }

    #[test]
    fn spent_budget_is_reported_before_sending() {
        let started = Instant::now().checked_sub(Duration::from_secs(2)).expect("monotonic clock past 2s");
        let err = TadoClient::budget_left(started, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TadoClientError::BudgetSpent(_)));

        let left = TadoClient::budget_left(Instant::now(), Duration::from_secs(5)).expect("budget left");
        assert!(left <= Duration::from_secs(5));
    }

    #[test]
    fn json_errors_name_the_field_path() {
        let mut de = serde_json::Deserializer::from_str(r#"{"presence":"SOMEWHERE"}"#);
        let err = serde_path_to_error::deserialize::<_, HomeState>(&mut de).unwrap_err();
        let msg = TadoClientError::Json(err).to_string();
        assert!(msg.contains("presence"), "unexpected message: {msg}");
    }

    #[test]
    fn token_freshness_respects_margin() {
        let stale = OAuthToken {
            access_token: "a".into(),
            expires_at: Instant::now() + Duration::from_secs(10),
        };
        assert!(!stale.is_fresh());

        let fresh = OAuthToken {
            access_token: "b".into(),
            expires_at: Instant::now() + Duration::from_secs(600),
        };
        assert!(fresh.is_fresh());
    }
}
