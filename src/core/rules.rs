use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::utils::{WafError, WafResult};

/// An uncompiled rule as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleSpec {
    /// Regular expression, matched case-insensitively
    pub pattern: String,
    /// Label reported when the pattern matches (e.g. "xss")
    pub category: String,
}

impl RuleSpec {
    pub fn new(pattern: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            category: category.into(),
        }
    }
}

/// The stock rules: markup brackets, SQL verbs, then script hooks.
pub fn default_rules() -> Vec<RuleSpec> {
    vec![
        RuleSpec::new("(<|>)", "xss"),
        RuleSpec::new("(union|select|insert|update|delete|drop|alter)", "sqli"),
        RuleSpec::new("(script|onerror|onload|alert)", "script"),
    ]
}

/// A compiled detection pattern with its category.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    category: String,
}

impl Rule {
    /// Compile a rule. Matching is always case-insensitive.
    pub fn compile(spec: &RuleSpec) -> WafResult<Self> {
        let pattern = RegexBuilder::new(&spec.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| WafError::InvalidPattern {
                category: spec.category.clone(),
                source,
            })?;

        Ok(Self {
            pattern,
            category: spec.category.clone(),
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.pattern.is_match(value)
    }
}

/// Ordered rules; the first matching rule decides the category.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compile every rule in declaration order.
    ///
    /// Fails on the first malformed pattern, and on an empty list.
    pub fn compile(specs: &[RuleSpec]) -> WafResult<Self> {
        if specs.is_empty() {
            return Err(WafError::EmptyRuleSet);
        }

        let rules = specs.iter().map(Rule::compile).collect::<WafResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

/// Stateless lexical scanner over a [`RuleSet`].
///
/// Values must already be decoded by the caller; the matcher looks at the
/// surface text only.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    rules: RuleSet,
}

impl PatternMatcher {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Category of the first rule matching `value`, if any.
    pub fn scan(&self, value: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(value))
            .map(Rule::category)
    }
}
