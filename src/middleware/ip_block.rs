//! IP blocking: static block list, temporary bans and suspicious requests.
//!
//! # Checks
//!
//! Applied in order; the first failing check answers with `403`:
//!
//! 1. Client IP in `BANNED_IPS` (exact or CIDR) or temporarily banned
//! 2. A `SUSPICIOUS_HEADERS` pattern matches its header; the IP is banned
//!    temporarily as a side effect
//! 3. The user agent contains a known scanner or bot marker (no ban)
//!
//! Temporary bans live in a shared [`BanList`]. Expired entries are ignored on
//! lookup and purged periodically by the sweeper owned by `AppState`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::USER_AGENT;
use axum::http::{HeaderName, Request, Response};
use axum::response::IntoResponse;
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::{CidrRange, ClientIpExt};
use crate::config::{Config, MAX_TEMP_BAN};
use crate::error::{AppError, AppResult, Rejection};
use crate::metrics;

/// User agent fragments that are always refused.
pub const SUSPICIOUS_USER_AGENTS: [&str; 8] = [
    "bot",
    "crawler",
    "spider",
    "scanner",
    "sqlmap",
    "nmap",
    "nikto",
    "metasploit",
];

// =============================================================================
// Block List
// =============================================================================

/// Permanently blocked addresses.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    exact: HashSet<String>,
    ranges: Vec<CidrRange>,
}

impl BlockList {
    /// Build from `BANNED_IPS` entries. Entries with a `/` are CIDR ranges;
    /// blank entries are ignored.
    pub fn new(entries: &[String]) -> Self {
        let mut list = Self::default();

        for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            if entry.contains('/') {
                match CidrRange::parse(entry) {
                    Some(range) => list.ranges.push(range),
                    None => warn!(entry, "Invalid CIDR range in BANNED_IPS, skipping"),
                }
            } else {
                list.exact.insert(entry.to_string());
            }
        }

        list
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.ranges.is_empty()
    }

    pub fn contains(&self, ip: &str) -> bool {
        if self.exact.contains(ip) {
            return true;
        }
        if self.ranges.is_empty() {
            return false;
        }
        ip.parse::<IpAddr>()
            .is_ok_and(|addr| self.ranges.iter().any(|range| range.contains(&addr)))
    }
}

// =============================================================================
// Temporary Bans
// =============================================================================

/// Shared set of temporarily banned addresses with their expiry.
#[derive(Debug, Clone, Default)]
pub struct BanList {
    entries: Arc<DashMap<String, Instant>>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban `ip` for `duration` from now, extending any existing ban.
    ///
    /// Durations longer than [`MAX_TEMP_BAN`] are clamped.
    pub fn ban(&self, ip: &str, duration: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(duration.min(MAX_TEMP_BAN))
            .unwrap_or(now);
        self.entries
            .entry(ip.to_string())
            .and_modify(|existing| {
                if *existing < until {
                    *existing = until;
                }
            })
            .or_insert(until);
        metrics::record_temp_ban();
        metrics::set_active_bans(self.entries.len());
    }

    /// Whether `ip` is currently banned. An expired entry is removed.
    pub fn is_banned(&self, ip: &str) -> bool {
        let now = Instant::now();
        let expired = match self.entries.get(ip) {
            Some(until) if *until > now => return true,
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(ip, |_, until| *until <= now);
        }
        false
    }

    /// Remove expired bans, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.entries.len());

        metrics::set_active_bans(self.entries.len());
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Layer
// =============================================================================

#[derive(Debug)]
struct IpBlockRules {
    blocked: BlockList,
    suspicious_headers: Vec<(HeaderName, Regex)>,
    ban_duration: Duration,
}

/// IP blocking layer.
#[derive(Clone)]
pub struct IpBlockLayer {
    rules: Arc<IpBlockRules>,
    bans: BanList,
}

impl IpBlockLayer {
    /// Build from configuration, sharing `bans` with the sweeper.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a suspicious header name or pattern
    /// is invalid.
    pub fn from_config(config: &Config, bans: BanList) -> AppResult<Self> {
        let suspicious_headers = config
            .suspicious_headers
            .iter()
            .map(|(name, pattern)| compile_header_rule(name, pattern))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            rules: Arc::new(IpBlockRules {
                blocked: BlockList::new(&config.banned_ips),
                suspicious_headers,
                ban_duration: config.temp_ban_duration,
            }),
            bans,
        })
    }
}

fn compile_header_rule(name: &str, pattern: &str) -> AppResult<(HeaderName, Regex)> {
    let header = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| AppError::ConfigError(format!("Invalid header name '{name}': {e}")))?;
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| AppError::ConfigError(format!("Invalid pattern for '{name}': {e}")))?;
    Ok((header, regex))
}

impl<S> Layer<S> for IpBlockLayer {
    type Service = IpBlockService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpBlockService {
            inner,
            rules: self.rules.clone(),
            bans: self.bans.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IpBlockService<S> {
    inner: S,
    rules: Arc<IpBlockRules>,
    bans: BanList,
}

impl<S> IpBlockService<S> {
    fn check<B>(&self, req: &Request<B>) -> Result<(), Rejection> {
        let client_ip = req.client_ip();

        if self.rules.blocked.contains(&client_ip) || self.bans.is_banned(&client_ip) {
            warn!(client_ip = %client_ip, "Blocked request from banned IP");
            return Err(Rejection::IpBlocked);
        }

        for (header, pattern) in &self.rules.suspicious_headers {
            let value = req
                .headers()
                .get(header)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if pattern.is_match(value) {
                warn!(
                    client_ip = %client_ip,
                    header = %header,
                    value,
                    "Suspicious header detected, banning IP temporarily"
                );
                self.bans.ban(&client_ip, self.rules.ban_duration);
                return Err(Rejection::SuspiciousHeaders);
            }
        }

        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if let Some(marker) = SUSPICIOUS_USER_AGENTS
            .iter()
            .find(|marker| user_agent.contains(*marker))
        {
            warn!(
                client_ip = %client_ip,
                user_agent = %user_agent,
                marker,
                "Suspicious user agent"
            );
            return Err(Rejection::SuspiciousUserAgent);
        }

        debug!(client_ip = %client_ip, "IP checks passed");
        Ok(())
    }
}

impl<S> Service<Request<Body>> for IpBlockService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let verdict = self.check(&req);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match verdict {
                Ok(()) => inner.call(req).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}
