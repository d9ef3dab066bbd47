//! Client IP resolution shared by every stage that keys on the caller's address.
//!
//! # Resolution Order
//!
//! 1. `X-Forwarded-For` (first entry of the comma-separated chain)
//! 2. `X-Real-IP`
//! 3. The TCP peer address (`ConnectInfo<SocketAddr>`)
//! 4. [`UNKNOWN_IP`]
//!
//! # Trusted Proxies
//!
//! When `TRUSTED_PROXIES` is configured and the peer address is known, the
//! forwarding headers are only honoured if the peer sits inside one of the
//! trusted CIDR ranges. A direct client cannot then pick its own address by
//! sending `X-Forwarded-For`. Without a configured range every forwarding header
//! is trusted, which is only safe behind a proxy that overwrites them.
//!
//! The resolved address is stored once per request as a [`ClientIp`]
//! extension by the request context stage; later stages read it through
//! [`ClientIpExt`].

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback IP value when no client IP can be determined.
///
/// All requests without identifiable IPs share this key for rate limiting.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is accepted as a single-host range. Returns `None` if
    /// the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let Some((addr, prefix)) = cidr.split_once('/') else {
            let ip: IpAddr = cidr.parse().ok()?;
            return Some(Self {
                network: ip,
                prefix_len: max_prefix(&ip),
            });
        };

        let ip: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;

        if prefix_len > max_prefix(&ip) {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Configuration for trusted proxy validation.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Create a new trusted proxy configuration from CIDR strings.
    ///
    /// Invalid CIDR strings are logged as warnings and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    /// Check if trusted proxy validation is enabled (any ranges configured).
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether forwarding headers from this peer may be believed.
    ///
    /// Always true when no ranges are configured.
    pub fn is_trusted(&self, peer: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(peer))
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Where the client address was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSource {
    ForwardedFor,
    RealIp,
    Peer,
    Unknown,
}

/// The resolved client address of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp {
    pub addr: String,
    pub source: IpSource,
}

impl ClientIp {
    pub fn as_str(&self) -> &str {
        &self.addr
    }

    /// Parsed address, if the resolved value is a literal IP.
    pub fn parsed(&self) -> Option<IpAddr> {
        self.addr.parse().ok()
    }
}

/// First non-blank forwarding header value, `X-Forwarded-For` before `X-Real-IP`.
#[inline]
fn forwarded_header<B>(req: &Request<B>) -> Option<(&str, IpSource)> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return Some((first_ip, IpSource::ForwardedFor));
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return Some((value.trim(), IpSource::RealIp));
    }

    None
}

fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client address of a request.
pub fn resolve_client_ip<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> ClientIp {
    let peer = peer_addr(req);

    if let Some((addr, source)) = forwarded_header(req) {
        match peer {
            Some(peer) if !trusted_proxies.is_trusted(&peer) => {
                debug!(
                    peer = %peer,
                    claimed = addr,
                    "Ignoring forwarding header from untrusted peer"
                );
            }
            _ => {
                return ClientIp {
                    addr: addr.to_string(),
                    source,
                };
            }
        }
    }

    match peer {
        Some(peer) => ClientIp {
            addr: peer.to_string(),
            source: IpSource::Peer,
        },
        None => ClientIp {
            addr: UNKNOWN_IP.to_string(),
            source: IpSource::Unknown,
        },
    }
}

/// Access to the client address resolved earlier in the pipeline.
pub trait ClientIpExt {
    /// The stored [`ClientIp`], or a fresh resolution without proxy checks.
    fn client_ip(&self) -> Cow<'_, str>;
}

impl<B> ClientIpExt for Request<B> {
    fn client_ip(&self) -> Cow<'_, str> {
        match self.extensions().get::<ClientIp>() {
            Some(ip) => Cow::Borrowed(ip.as_str()),
            None => Cow::Owned(resolve_client_ip(self, &TrustedProxyConfig::default()).addr),
        }
    }
}
