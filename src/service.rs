use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ShieldPolicy;
use crate::core::{
    Admission, AuditRecord, AuditSink, Clock, CounterStore, CountryLookup, GeoClassifier,
    PatternMatcher, RateLimiter, RuleSet,
};
use crate::utils::{log_allow, log_block, WafResult};

/// Field collections scanned for malicious input, in scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Query,
    Body,
    Cookie,
    /// Query, body and cookies merged; later collections override earlier
    /// values for the same name
    Combined,
}

impl Namespace {
    pub const SCAN_ORDER: [Namespace; 4] = [
        Namespace::Query,
        Namespace::Body,
        Namespace::Cookie,
        Namespace::Combined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Query => "query",
            Namespace::Body => "body",
            Namespace::Cookie => "cookie",
            Namespace::Combined => "request",
        }
    }
}

/// An inbound request as seen by the shield. Field values are already decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub source_address: String,
    pub query: Vec<(String, String)>,
    pub body: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
}

impl Request {
    pub fn new(source_address: impl Into<String>) -> Self {
        Self {
            source_address: source_address.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.body.push((name.into(), value.into()));
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Fields of one namespace, in arrival order.
    pub fn fields(&self, namespace: Namespace) -> Cow<'_, [(String, String)]> {
        match namespace {
            Namespace::Query => Cow::Borrowed(&self.query),
            Namespace::Body => Cow::Borrowed(&self.body),
            Namespace::Cookie => Cow::Borrowed(&self.cookies),
            Namespace::Combined => Cow::Owned(self.combined()),
        }
    }

    fn combined(&self) -> Vec<(String, String)> {
        let mut merged: Vec<(String, String)> = Vec::new();
        for (name, value) in self.query.iter().chain(&self.body).chain(&self.cookies) {
            match merged.iter_mut().find(|(existing, _)| existing == name) {
                Some(slot) => slot.1.clone_from(value),
                None => merged.push((name.clone(), value.clone())),
            }
        }
        merged
    }

    /// Rate limit key: canonical form of an IP literal, otherwise verbatim.
    pub fn source_key(&self) -> String {
        let raw = self.source_address.trim();
        raw.parse::<IpAddr>()
            .map_or_else(|_| raw.to_string(), |ip| ip.to_string())
    }
}

/// Why a request was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockCategory {
    RateLimited,
    CountryBlocked,
    MaliciousInput,
}

impl BlockCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockCategory::RateLimited => "rate_limited",
            BlockCategory::CountryBlocked => "country_blocked",
            BlockCategory::MaliciousInput => "malicious_input",
        }
    }
}

/// A BLOCK decision with its category and detail (country code or rule
/// category; empty for rate limiting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub category: BlockCategory,
    pub detail: String,
}

impl Block {
    pub fn new(category: BlockCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }

    /// Human readable reason, as written to the audit log.
    pub fn reason(&self) -> String {
        match self.category {
            BlockCategory::RateLimited => "Rate limit exceeded".to_string(),
            BlockCategory::CountryBlocked => format!("Blocked Country [{}]", self.detail),
            BlockCategory::MaliciousInput => format!("Malicious Input Detected [{}]", self.detail),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// Terminal decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(Block),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn block(&self) -> Option<&Block> {
        match self {
            Verdict::Allow => None,
            Verdict::Block(block) => Some(block),
        }
    }
}

/// External collaborators the pipeline is wired to.
pub struct Collaborators {
    pub store: Arc<dyn CounterStore>,
    pub lookup: Arc<dyn CountryLookup>,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Arc<dyn Clock>,
}

/// Inline request mitigation: rate limit, then geography, then content.
///
/// The first failing check decides the verdict; every BLOCK is audited once
/// before it is returned.
pub struct MitigationPipeline {
    rate_limiter: RateLimiter,
    geo: GeoClassifier,
    matcher: PatternMatcher,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    whitelist_bypasses_rate_limit: bool,
    audit_timeout: Duration,
}

impl MitigationPipeline {
    /// Build a pipeline from an immutable policy.
    ///
    /// Fails when the rules do not compile or the limits are out of range.
    pub fn new(policy: &ShieldPolicy, collaborators: Collaborators) -> WafResult<Self> {
        let rules = RuleSet::compile(&policy.rules)?;
        let rate_limiter = RateLimiter::new(
            &policy.rate_limit,
            collaborators.store,
            Arc::clone(&collaborators.clock),
        )?;

        tracing::info!(
            rules = rules.len(),
            blocked_countries = policy.geo.blocked.len(),
            whitelist = policy.geo.whitelist.len(),
            max_requests = policy.rate_limit.max_requests,
            window_seconds = policy.rate_limit.window.as_secs(),
            "Mitigation pipeline ready"
        );

        Ok(Self {
            rate_limiter,
            geo: GeoClassifier::new(collaborators.lookup, policy.geo.clone()),
            matcher: PatternMatcher::new(rules),
            audit: collaborators.audit,
            clock: collaborators.clock,
            whitelist_bypasses_rate_limit: policy.whitelist_bypasses_rate_limit,
            audit_timeout: policy.audit_timeout,
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Decide ALLOW or BLOCK for `request`.
    pub async fn evaluate(&self, request: &Request) -> Verdict {
        match self.decide(request).await {
            None => {
                log_allow(&request.source_address);
                Verdict::Allow
            }
            Some(block) => {
                let reason = block.reason();
                log_block(&request.source_address, block.category.as_str(), &reason);
                self.write_audit(&request.source_address, reason).await;
                Verdict::Block(block)
            }
        }
    }

    async fn decide(&self, request: &Request) -> Option<Block> {
        let address = request.source_address.as_str();

        let bypass = self.whitelist_bypasses_rate_limit && self.geo.is_whitelisted(address);
        if !bypass && self.rate_limiter.admit(&request.source_key()).await == Admission::Denied {
            return Some(Block::new(BlockCategory::RateLimited, ""));
        }

        if let Some(code) = self.geo.blocked_country(address).await {
            return Some(Block::new(BlockCategory::CountryBlocked, code.as_str()));
        }

        self.scan_fields(request)
    }

    fn scan_fields(&self, request: &Request) -> Option<Block> {
        for namespace in Namespace::SCAN_ORDER {
            for (name, value) in request.fields(namespace).iter() {
                if let Some(category) = self.matcher.scan(value) {
                    tracing::debug!(
                        namespace = namespace.as_str(),
                        field = %name,
                        category = %category,
                        "Malicious input matched"
                    );
                    return Some(Block::new(BlockCategory::MaliciousInput, category));
                }
            }
        }
        None
    }

    async fn write_audit(&self, source_address: &str, reason: String) {
        let record = AuditRecord {
            timestamp: self.clock.now(),
            source_address: source_address.to_string(),
            reason,
        };

        match tokio::time::timeout(self.audit_timeout, self.audit.record(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(source = %source_address, error = %e, "Audit write failed"),
            Err(_) => tracing::warn!(source = %source_address, "Audit write timed out"),
        }
    }
}
