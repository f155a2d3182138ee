//! Caller identity used to partition buckets.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

use crate::config::ClientIpConfig;
use crate::error::{AdmissionError, Result};

/// Principal name the auth layer uses for callers who never signed in.
pub const ANONYMOUS_PRINCIPAL: &str = "anonymousUser";

/// Longest identity kept, in bytes.
pub const MAX_IDENTITY_LEN: usize = 256;

/// Authentication outcome attached to a request by the auth layer, as a
/// request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authentication {
    principal: String,
    authenticated: bool,
}

impl Authentication {
    pub fn new(principal: impl Into<String>, authenticated: bool) -> Self {
        Self {
            principal: principal.into(),
            authenticated,
        }
    }

    pub fn user(principal: impl Into<String>) -> Self {
        Self::new(principal, true)
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_PRINCIPAL, false)
    }

    pub fn principal_name(&self) -> &str {
        &self.principal
    }

    /// Signed in with a real principal. The anonymous placeholder never counts.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated && self.principal != ANONYMOUS_PRINCIPAL
    }
}

/// `user:<name>` or `ip:<addr>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn user(name: &str) -> Self {
        Self::tagged("user:", name)
    }

    pub fn ip(addr: &str) -> Self {
        Self::tagged("ip:", addr)
    }

    /// Placeholder used when no source yields an identity.
    pub fn unknown() -> Self {
        Self::ip("unknown")
    }

    fn tagged(tag: &str, value: &str) -> Self {
        let mut identity = String::with_capacity(tag.len() + value.len());
        identity.push_str(tag);
        identity.push_str(value);

        if identity.len() > MAX_IDENTITY_LEN {
            let mut cut = MAX_IDENTITY_LEN;
            while !identity.is_char_boundary(cut) {
                cut -= 1;
            }
            identity.truncate(cut);
        }
        Self(identity)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the caller identity from the auth context, then the client address.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    trusted_proxies: Vec<IpNet>,
    trust_forwarded_for: bool,
}

impl IdentityResolver {
    pub fn new(config: &ClientIpConfig) -> Self {
        Self {
            trusted_proxies: config.trusted_proxies.clone(),
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }

    /// Resolve from the explicit request facts.
    ///
    /// `X-Forwarded-For` only counts when the peer is a trusted proxy or the
    /// legacy trust flag is on. Its first comma-separated entry is used as is,
    /// without trimming.
    pub fn resolve(
        &self,
        auth: Option<&Authentication>,
        forwarded_for: Option<&str>,
        peer: Option<IpAddr>,
    ) -> Result<Identity> {
        if let Some(auth) = auth.filter(|auth| auth.is_authenticated()) {
            return Ok(Identity::user(auth.principal_name()));
        }

        if self.trusts_forwarded_for(peer) {
            let client = forwarded_for
                .and_then(|xff| xff.split(',').next())
                .filter(|first| !first.is_empty());
            if let Some(client) = client {
                return Ok(Identity::ip(client));
            }
        }

        peer.map(|ip| Identity::ip(&ip.to_string()))
            .ok_or(AdmissionError::ResolverFailure)
    }

    fn trusts_forwarded_for(&self, peer: Option<IpAddr>) -> bool {
        if self.trust_forwarded_for {
            return true;
        }
        peer.is_some_and(|ip| self.trusted_proxies.iter().any(|net| net.contains(&ip)))
    }
}
