//! Request gate: the three-stage filter chain applied to a WebSocket
//! upgrade request before a connection is admitted.

use dashmap::DashMap;
use std::collections::HashSet;

use crate::core::id_string;
use crate::error::HubError;
use crate::rate_limit::{RateLimitConfig, RateLimitResult, RateLimitStore};

use super::FilterOutcome;

/// Everything the request gate needs to know about one upgrade attempt.
/// Fields the core has no REST surface to populate (origin/referer/ua come
/// straight off the HTTP request; `csrf_session_id` identifies whichever
/// session previously minted the csrf token, established by a collaborator
/// login flow outside this crate's scope).
pub struct UpgradeRequest<'a> {
    pub ip: &'a str,
    pub origin: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub csrf_token: Option<&'a str>,
    pub csrf_session_id: Option<&'a str>,
}

/// Mints and validates the per-session CSRF tokens the request gate checks.
pub struct CsrfStore {
    tokens: DashMap<String, String>,
}

impl CsrfStore {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    pub fn mint(&self, session_id: &str) -> String {
        let token = id_string();
        self.tokens.insert(session_id.to_string(), token.clone());
        token
    }

    pub fn validate(&self, session_id: &str, token: &str) -> bool {
        use subtle::ConstantTimeEq;
        self.tokens
            .get(session_id)
            .map(|t| t.as_bytes().ct_eq(token.as_bytes()).into())
            .unwrap_or(false)
    }
}

impl Default for CsrfStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OriginBlacklist {
    origins: HashSet<String>,
    user_agents: HashSet<String>,
}

impl OriginBlacklist {
    pub fn new(origins: impl IntoIterator<Item = String>, user_agents: impl IntoIterator<Item = String>) -> Self {
        Self {
            origins: origins.into_iter().collect(),
            user_agents: user_agents.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            origins: HashSet::new(),
            user_agents: HashSet::new(),
        }
    }

    fn blocks(&self, req: &UpgradeRequest) -> bool {
        if let Some(origin) = req.origin {
            if self.origins.contains(origin) {
                return true;
            }
        }
        if let Some(ua) = req.user_agent {
            if self.user_agents.contains(ua) {
                return true;
            }
        }
        false
    }
}

pub struct RequestGate {
    rate_limits: RateLimitStore,
    connect_rate_config: RateLimitConfig,
    csrf: CsrfStore,
    blacklist: OriginBlacklist,
    allowed_origins: HashSet<String>,
    csrf_required: bool,
}

impl RequestGate {
    pub fn new(
        connect_rate_config: RateLimitConfig,
        allowed_origins: impl IntoIterator<Item = String>,
        csrf_required: bool,
        blacklist: OriginBlacklist,
    ) -> Self {
        Self {
            rate_limits: RateLimitStore::new(),
            connect_rate_config,
            csrf: CsrfStore::new(),
            blacklist,
            allowed_origins: allowed_origins.into_iter().collect(),
            csrf_required,
        }
    }

    pub fn csrf_store(&self) -> &CsrfStore {
        &self.csrf
    }

    /// Run all three stages in order; short-circuits on the first deny.
    pub fn evaluate(&self, req: &UpgradeRequest) -> FilterOutcome {
        // Stage 1: DDoS / connect rate limit — cheapest check first.
        match self.rate_limits.record("connect_rate", req.ip, None, &self.connect_rate_config) {
            RateLimitResult::Locked { retry_after_ms } => {
                return FilterOutcome::Deny(HubError::RateLimited { retry_after_ms });
            }
            RateLimitResult::Ok { .. } => {}
        }

        // Stage 2: CSRF.
        if self.csrf_required {
            let origin_or_referer_present = req.origin.is_some() || req.referer.is_some();

            if let Some(origin) = req.origin {
                if !self.allowed_origins.contains(origin) {
                    return FilterOutcome::Deny(HubError::ForbiddenOrigin);
                }
            }

            let token_valid = match (req.csrf_session_id, req.csrf_token) {
                (Some(session_id), Some(token)) => self.csrf.validate(session_id, token),
                _ => false,
            };

            if origin_or_referer_present {
                if !token_valid {
                    return FilterOutcome::Deny(HubError::CsrfInvalid);
                }
            } else if !token_valid {
                // No origin/referer at all: a valid token alone is sufficient,
                // but we still require one to exist.
                return FilterOutcome::Deny(HubError::CsrfInvalid);
            }
        }

        // Stage 3: origin / user-agent blacklist.
        if self.blacklist.blocks(req) {
            return FilterOutcome::Deny(HubError::ForbiddenOrigin);
        }

        FilterOutcome::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(allowed: &[&str]) -> RequestGate {
        RequestGate::new(
            RateLimitConfig::connect_rate(100, 10_000),
            allowed.iter().map(|s| s.to_string()),
            true,
            OriginBlacklist::empty(),
        )
    }

    #[test]
    fn valid_token_with_no_origin_is_allowed() {
        let gate = gate(&["http://localhost:3000"]);
        let token = gate.csrf_store().mint("sess1");
        let req = UpgradeRequest {
            ip: "1.2.3.4",
            origin: None,
            referer: None,
            user_agent: None,
            csrf_token: Some(&token),
            csrf_session_id: Some("sess1"),
        };
        assert!(matches!(gate.evaluate(&req), FilterOutcome::Allow));
    }

    #[test]
    fn disallowed_origin_is_rejected() {
        let gate = gate(&["http://localhost:3000"]);
        let token = gate.csrf_store().mint("sess1");
        let req = UpgradeRequest {
            ip: "1.2.3.4",
            origin: Some("http://evil.example"),
            referer: None,
            user_agent: None,
            csrf_token: Some(&token),
            csrf_session_id: Some("sess1"),
        };
        assert!(matches!(
            gate.evaluate(&req),
            FilterOutcome::Deny(HubError::ForbiddenOrigin)
        ));
    }

    #[test]
    fn missing_csrf_token_is_rejected() {
        let gate = gate(&["http://localhost:3000"]);
        let req = UpgradeRequest {
            ip: "1.2.3.4",
            origin: Some("http://localhost:3000"),
            referer: None,
            user_agent: None,
            csrf_token: None,
            csrf_session_id: None,
        };
        assert!(matches!(
            gate.evaluate(&req),
            FilterOutcome::Deny(HubError::CsrfInvalid)
        ));
    }

    #[test]
    fn connect_rate_lockout_short_circuits() {
        let gate = RequestGate::new(
            RateLimitConfig::connect_rate(2, 60_000),
            ["http://localhost:3000".to_string()],
            false,
            OriginBlacklist::empty(),
        );
        let req = UpgradeRequest {
            ip: "9.9.9.9",
            origin: None,
            referer: None,
            user_agent: None,
            csrf_token: None,
            csrf_session_id: None,
        };
        assert!(matches!(gate.evaluate(&req), FilterOutcome::Allow));
        assert!(matches!(
            gate.evaluate(&req),
            FilterOutcome::Deny(HubError::RateLimited { .. })
        ));
    }
}
