use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a matching rule does to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Block,
    Challenge,
    Allow,
    Log,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Block => "BLOCK",
            Action::Challenge => "CHALLENGE",
            Action::Allow => "ALLOW",
            Action::Log => "LOG",
        }
    }

    /// CHALLENGE is rendered identically to BLOCK; both terminate the request.
    pub fn terminates(self) -> bool {
        matches!(self, Action::Block | Action::Challenge)
    }
}

/// Comparison applied by a single predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    IsNull,
    IsNotNull,
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Matches,
    NotMatches,
    In,
    NotIn,
    GreaterThan,
    LessThan,
}

/// A single `(field, operator, value)` test against the projected request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

/// A user-defined firewall rule. The expression is a conjunctive predicate
/// list; an empty expression matches every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
    pub action: Action,
    #[serde(default)]
    pub expression: Vec<Predicate>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub priority: u32,
    #[serde(default)]
    pub trigger_alert: bool,
    #[serde(default)]
    pub block_http_code: Option<u16>,
}

/// Tag carried by the auto-generated global ALLOW rule that admits a route's
/// host into per-route evaluation.
pub const ROUTE_ADMISSION_TAG: &str = "auto:route-admission";

/// Prefix of the tag linking an admission rule to its owning route id.
pub const ROUTE_LINK_TAG_PREFIX: &str = "route:";

impl Rule {
    pub fn is_route_admission(&self) -> bool {
        self.tags.iter().any(|tag| tag == ROUTE_ADMISSION_TAG)
    }

    /// Route id a route-admission rule is bound to, if any.
    pub fn linked_route_id(&self) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|tag| tag.strip_prefix(ROUTE_LINK_TAG_PREFIX))
    }
}
