//! Forwarding rules and the matching engine.
//!
//! A message matches a rule when:
//! 1. its originating address is listed on the rule (exact string match), and
//! 2. every filter on the rule passes (a rule with no filters passes).
//!
//! Matching is pure — no I/O, no clock, deterministic for a given rule set.
//! The intake stage loads the rules from the store and hands them in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

// ── Rule types ──────────────────────────────────────────────────────

/// What a filter does with its matched text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    /// Body must contain the filter text.
    Include,
    /// Body must NOT contain the filter text.
    Exclude,
}

impl FilterKind {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Exclude => "exclude",
        }
    }
}

/// A single body filter attached to a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingFilter {
    pub id: Uuid,
    pub kind: FilterKind,
    /// Substring searched for in the message body.
    pub text: String,
    /// Compare case-insensitively when set.
    pub ignore_case: bool,
}

impl ForwardingFilter {
    /// Whether a message body passes this filter.
    pub fn passes(&self, body: &str) -> bool {
        let contained = if self.ignore_case {
            body.to_lowercase().contains(&self.text.to_lowercase())
        } else {
            body.contains(&self.text)
        };
        match self.kind {
            FilterKind::Include => contained,
            FilterKind::Exclude => !contained,
        }
    }
}

/// A user-defined forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: Uuid,
    /// Display name, no uniqueness requirement.
    pub name: String,
    /// Opaque classification token submitted to the backend. Several rules
    /// may share one.
    pub type_key: String,
    /// Addresses this rule applies to. Exact-match set.
    pub addresses: Vec<String>,
    pub filters: Vec<ForwardingFilter>,
    pub created_at: DateTime<Utc>,
}

impl ForwardingRule {
    /// Whether this rule matches a message.
    ///
    /// The address gate is checked first; filters are not evaluated for a
    /// message from an address the rule does not apply to.
    pub fn matches(&self, address: &str, body: &str) -> bool {
        if !self.addresses.iter().any(|a| a == address) {
            return false;
        }
        self.filters.iter().all(|f| f.passes(body))
    }
}

// ── New-rule inputs ─────────────────────────────────────────────────

/// Input for creating a filter (id is assigned by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFilter {
    pub kind: FilterKind,
    pub text: String,
    #[serde(default)]
    pub ignore_case: bool,
}

/// Input for creating a rule (id and timestamps are assigned by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub type_key: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub filters: Vec<NewFilter>,
}

// ── Matching ────────────────────────────────────────────────────────

/// Evaluate a message against every rule.
///
/// Returns the matching rules in input order. No de-duplication: two rules
/// sharing a `type_key` both appear. Empty result means the message is not
/// forwarded.
pub fn matching_rules<'a>(
    address: &str,
    body: &str,
    rules: &'a [ForwardingRule],
) -> Vec<&'a ForwardingRule> {
    let matched: Vec<&ForwardingRule> = rules
        .iter()
        .filter(|rule| rule.matches(address, body))
        .collect();

    for rule in &matched {
        debug!(rule = %rule.name, type_key = %rule.type_key, "Rule matched message");
    }
    matched
}
