use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;

/// How a route picks a backend for each request.
///
/// `sticky` and `slippery` are the canary strategies: both tag responses
/// with a session cookie, but only `sticky` pins later requests to the
/// cookie's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Random,
    RoundRobin,
    Sticky,
    Slippery,
}

impl Strategy {
    pub fn is_canary(self) -> bool {
        matches!(self, Strategy::Sticky | Strategy::Slippery)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::RoundRobin => "round-robin",
            Strategy::Sticky => "sticky",
            Strategy::Slippery => "slippery",
        }
    }
}

impl FromStr for Strategy {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "random" => Ok(Strategy::Random),
            "round-robin" => Ok(Strategy::RoundRobin),
            "sticky" => Ok(Strategy::Sticky),
            "slippery" => Ok(Strategy::Slippery),
            other => Err(GatewayError::ConfigInvalid(format!(
                "unknown strategy {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the session cookie for a route.
pub fn cookie_name(route: &str) -> String {
    format!("{route}_sticky")
}

/// Extract a cookie value from the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    let header = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            value.parse().ok()
        } else {
            None
        }
    })
}

/// Render the `Set-Cookie` value pinning a session to `backend_id`.
pub fn sticky_cookie(name: &str, backend_id: Uuid, ttl: Duration) -> String {
    format!("{name}={backend_id}; Path=/; Max-Age={}", ttl.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    #[test]
    fn strategy_parses_kebab_case() {
        assert_eq!("round-robin".parse::<Strategy>().expect("parse"), Strategy::RoundRobin);
        assert_eq!("Sticky".parse::<Strategy>().expect("parse"), Strategy::Sticky);
        assert!("least-conn".parse::<Strategy>().is_err());
        assert!(Strategy::Slippery.is_canary());
        assert!(!Strategy::Random.is_canary());
    }

    #[test]
    fn cookie_round_trip() {
        let backend_id = Uuid::new_v4();
        let rendered = sticky_cookie("api_sticky", backend_id, Duration::from_secs(120));
        assert!(rendered.ends_with("Max-Age=120"));

        let mut headers = HeaderMap::new();
        let pair = rendered.split(';').next().expect("cookie pair");
        headers.insert(
            COOKIE,
            format!("other=1; {pair}").parse().expect("header"),
        );
        assert_eq!(cookie_value(&headers, "api_sticky"), Some(backend_id));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
