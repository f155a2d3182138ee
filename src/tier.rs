use axum::http::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Rate limit tier a request is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Authentication endpoints: login, registration, password reset.
    Strict,
    /// Writes to posts, comments, likes and follows.
    Moderate,
    /// Everything else from a signed-in caller.
    Authenticated,
    /// Everything else from an anonymous caller.
    Lenient,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Strict, Tier::Moderate, Tier::Authenticated, Tier::Lenient];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strict => "STRICT",
            Tier::Moderate => "MODERATE",
            Tier::Authenticated => "AUTHENTICATED",
            Tier::Lenient => "LENIENT",
        }
    }

    /// Classify a request. First match wins; matching is case-sensitive and
    /// the resource check is a plain substring test.
    pub fn classify(path: &str, method: &Method, is_authenticated: bool) -> Tier {
        const AUTH_PREFIX: &str = "/api/auth/";
        const WRITE_RESOURCES: [&str; 4] = ["/posts", "/comments", "/likes", "/follow"];

        if path.starts_with(AUTH_PREFIX) {
            return Tier::Strict;
        }

        let is_write = *method == Method::POST || *method == Method::PUT || *method == Method::DELETE;
        if is_write && WRITE_RESOURCES.iter().any(|resource| path.contains(resource)) {
            return Tier::Moderate;
        }

        if is_authenticated {
            Tier::Authenticated
        } else {
            Tier::Lenient
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `capacity` tokens granted once per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TierLimit {
    #[validate(range(min = 1, message = "capacity must be greater than 0"))]
    pub capacity: u64,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "non_zero_duration"))]
    pub window: Duration,
}

impl TierLimit {
    pub const fn per_minute(capacity: u64) -> Self {
        Self {
            capacity,
            window: Duration::from_secs(60),
        }
    }
}

/// Parses `<capacity>/<window>`, e.g. `10/60s` or `100/1m`.
impl FromStr for TierLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (capacity, window) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <capacity>/<window>, got '{}'", s))?;
        let capacity = capacity
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid capacity '{}': {}", capacity, e))?;
        let window = humantime::parse_duration(window.trim())
            .map_err(|e| format!("invalid window '{}': {}", window, e))?;
        Ok(Self { capacity, window })
    }
}

impl fmt::Display for TierLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.capacity, humantime::format_duration(self.window))
    }
}

pub(crate) fn non_zero_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        let mut err = ValidationError::new("non_zero_duration");
        err.message = Some("duration must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Limits for every tier. Immutable once the gate is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TierTable {
    #[validate(nested)]
    pub strict: TierLimit,
    #[validate(nested)]
    pub moderate: TierLimit,
    #[validate(nested)]
    pub lenient: TierLimit,
    #[validate(nested)]
    pub authenticated: TierLimit,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            strict: TierLimit::per_minute(10),
            moderate: TierLimit::per_minute(30),
            lenient: TierLimit::per_minute(60),
            authenticated: TierLimit::per_minute(100),
        }
    }
}

impl TierTable {
    pub fn limit(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Strict => self.strict,
            Tier::Moderate => self.moderate,
            Tier::Authenticated => self.authenticated,
            Tier::Lenient => self.lenient,
        }
    }
}
