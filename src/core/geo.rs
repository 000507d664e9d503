//! Country-based access control.
//!
//! The geolocation database is an external collaborator behind
//! [`CountryLookup`]. Anything short of a definite country code (lookup
//! errors, missing records, timeouts) classifies as unknown, and unknown
//! never blocks.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::{log_fail_open, WafError, WafResult};

/// ISO-3166 alpha-2 country code, stored upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CountryCode([u8; 2]);

impl CountryCode {
    pub fn as_str(&self) -> &str {
        // Both bytes are ASCII letters by construction.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl FromStr for CountryCode {
    type Err = WafError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().as_bytes() {
            [a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphabetic() => {
                Ok(Self([a.to_ascii_uppercase(), b.to_ascii_uppercase()]))
            }
            _ => Err(WafError::InvalidPolicy(format!("'{s}' is not an ISO-3166 alpha-2 code"))),
        }
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer from a [`CountryLookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(CountryCode),
    /// The database has no country for this address
    Unknown,
    /// The lookup itself failed
    Error(String),
}

/// Classification after lookup failures have been folded away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Country(CountryCode),
    Unknown,
}

/// Address to country resolution, backed by whatever database the host uses.
#[async_trait]
pub trait CountryLookup: Send + Sync {
    async fn lookup(&self, address: &str) -> LookupResult;
}

/// In-memory network table: the most specific matching network wins.
#[derive(Debug, Clone, Default)]
pub struct StaticCountryLookup {
    networks: Vec<(IpNet, CountryCode)>,
}

impl StaticCountryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(network, code)` pairs such as `("203.0.113.0/24", "US")`.
    /// A bare address is treated as a host network.
    pub fn from_pairs<I, N, C>(pairs: I) -> WafResult<Self>
    where
        I: IntoIterator<Item = (N, C)>,
        N: AsRef<str>,
        C: AsRef<str>,
    {
        let mut lookup = Self::new();
        for (network, code) in pairs {
            lookup = lookup.with_network(parse_network(network.as_ref())?, code.as_ref().parse()?);
        }
        Ok(lookup)
    }

    pub fn with_network(mut self, network: IpNet, code: CountryCode) -> Self {
        self.networks.push((network, code));
        self.networks
            .sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        self
    }
}

#[async_trait]
impl CountryLookup for StaticCountryLookup {
    async fn lookup(&self, address: &str) -> LookupResult {
        let ip: IpAddr = match address.trim().parse() {
            Ok(ip) => ip,
            Err(e) => return LookupResult::Error(format!("'{address}' is not an IP address: {e}")),
        };

        self.networks
            .iter()
            .find(|(network, _)| network.contains(&ip))
            .map_or(LookupResult::Unknown, |(_, code)| LookupResult::Found(*code))
    }
}

fn parse_network(raw: &str) -> WafResult<IpNet> {
    let raw = raw.trim();
    if let Ok(network) = raw.parse::<IpNet>() {
        return Ok(network);
    }
    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| WafError::InvalidPolicy(format!("'{raw}' is neither a network nor an address")))
}

/// Blocked countries and whitelisted sources.
#[derive(Debug, Clone, Default)]
pub struct GeoPolicy {
    pub blocked: HashSet<CountryCode>,
    pub whitelist: Vec<IpNet>,
    /// Bound on a single lookup
    pub lookup_timeout: Option<Duration>,
}

impl GeoPolicy {
    /// Parse country codes and whitelist entries (addresses or networks).
    pub fn parse<B, W>(blocked: B, whitelist: W, lookup_timeout: Option<Duration>) -> WafResult<Self>
    where
        B: IntoIterator,
        B::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        let blocked = blocked
            .into_iter()
            .map(|code| code.as_ref().parse())
            .collect::<WafResult<HashSet<_>>>()?;
        let whitelist = whitelist
            .into_iter()
            .map(|entry| parse_network(entry.as_ref()))
            .collect::<WafResult<Vec<_>>>()?;

        Ok(Self {
            blocked,
            whitelist,
            lookup_timeout,
        })
    }
}

/// Applies [`GeoPolicy`] to addresses resolved through a [`CountryLookup`].
pub struct GeoClassifier {
    lookup: Arc<dyn CountryLookup>,
    policy: GeoPolicy,
}

impl GeoClassifier {
    pub fn new(lookup: Arc<dyn CountryLookup>, policy: GeoPolicy) -> Self {
        Self { lookup, policy }
    }

    pub fn is_whitelisted(&self, address: &str) -> bool {
        address
            .trim()
            .parse::<IpAddr>()
            .map(|ip| self.policy.whitelist.iter().any(|net| net.contains(&ip)))
            .unwrap_or(false)
    }

    /// Resolve `address` to a country, folding failures into `Unknown`.
    pub async fn classify(&self, address: &str) -> Classification {
        let result = match self.policy.lookup_timeout {
            Some(limit) => tokio::time::timeout(limit, self.lookup.lookup(address))
                .await
                .unwrap_or_else(|_| LookupResult::Error("lookup timed out".into())),
            None => self.lookup.lookup(address).await,
        };

        match result {
            LookupResult::Found(code) => Classification::Country(code),
            LookupResult::Unknown => Classification::Unknown,
            LookupResult::Error(details) => {
                log_fail_open("geo", address, &details);
                Classification::Unknown
            }
        }
    }

    /// The blocked country `address` resolves to, if any.
    pub async fn blocked_country(&self, address: &str) -> Option<CountryCode> {
        if self.is_whitelisted(address) {
            return None;
        }

        match self.classify(address).await {
            Classification::Country(code) if self.policy.blocked.contains(&code) => Some(code),
            _ => None,
        }
    }

    pub async fn is_blocked(&self, address: &str) -> bool {
        self.blocked_country(address).await.is_some()
    }
}
