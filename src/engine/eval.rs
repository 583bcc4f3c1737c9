use serde_json::Value;

use super::fields::{format_number, FieldMap, FieldValue};
use super::model::{Operator, Predicate, Rule};
use super::regex_cache;
use crate::engine::Action;

/// Result of scanning a ruleset against a projected request. A closed sum;
/// callers match exhaustively instead of testing sentinel strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    NoMatch,
    Match {
        action: Action,
        rule_id: String,
        block_http_code: Option<u16>,
    },
}

/// Priority-ordered first-match scan over the enabled rules. Ties on priority
/// break lexicographically by id so the outcome is deterministic regardless
/// of input order.
pub fn evaluate_rules(rules: &[Rule], fields: &FieldMap) -> Outcome {
    let mut enabled: Vec<&Rule> = rules.iter().filter(|rule| rule.enabled).collect();
    enabled.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.id.cmp(&b.id))
    });

    for rule in enabled {
        if expression_matches(&rule.id, &rule.expression, fields) {
            return Outcome::Match {
                action: rule.action,
                rule_id: rule.id.clone(),
                block_http_code: rule.block_http_code,
            };
        }
    }
    Outcome::NoMatch
}

/// Conjunctive, left-to-right, short-circuiting. Empty expressions match.
pub fn expression_matches(rule_id: &str, predicates: &[Predicate], fields: &FieldMap) -> bool {
    predicates
        .iter()
        .enumerate()
        .all(|(index, predicate)| predicate_matches(rule_id, index, predicate, fields))
}

/// Evaluates one predicate. Never fails: type mismatches, absent fields, and
/// invalid regexes all evaluate to false (or true for the negated forms whose
/// base semantics require the field to be present).
pub fn predicate_matches(
    rule_id: &str,
    index: usize,
    predicate: &Predicate,
    fields: &FieldMap,
) -> bool {
    let actual = fields.get(&predicate.field);

    match predicate.operator {
        Operator::IsNull => return actual.is_none(),
        Operator::IsNotNull => return actual.is_some(),
        _ => {}
    }

    let Some(actual) = actual else {
        return false;
    };

    match predicate.operator {
        Operator::IsNull | Operator::IsNotNull => unreachable!("handled above"),
        Operator::Equals => loose_eq(actual, &predicate.value),
        Operator::NotEquals => !loose_eq(actual, &predicate.value),
        Operator::Contains => contains(actual, &predicate.value),
        Operator::NotContains => !contains(actual, &predicate.value),
        Operator::Matches => regex_match(rule_id, index, actual, &predicate.value),
        Operator::NotMatches => !regex_match(rule_id, index, actual, &predicate.value),
        Operator::In => member_of(actual, &predicate.value),
        Operator::NotIn => !member_of(actual, &predicate.value),
        Operator::GreaterThan => ordered(actual, &predicate.value, std::cmp::Ordering::Greater),
        Operator::LessThan => ordered(actual, &predicate.value, std::cmp::Ordering::Less),
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(
            number
                .as_f64()
                .map(format_number)
                .unwrap_or_else(|| number.to_string()),
        ),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn loose_eq(actual: &FieldValue, expected: &Value) -> bool {
    match value_text(expected) {
        Some(text) => actual.as_text() == text,
        None => false,
    }
}

fn contains(actual: &FieldValue, needle: &Value) -> bool {
    let Some(haystack) = actual.as_str() else {
        return false;
    };
    match value_text(needle) {
        Some(text) => haystack.contains(&text),
        None => false,
    }
}

fn member_of(actual: &FieldValue, list: &Value) -> bool {
    let Value::Array(members) = list else {
        return false;
    };
    let text = actual.as_text();
    members
        .iter()
        .filter_map(value_text)
        .any(|member| member == text)
}

fn ordered(actual: &FieldValue, expected: &Value, wanted: std::cmp::Ordering) -> bool {
    let Some(expected_text) = value_text(expected) else {
        return false;
    };
    let actual_number = actual.as_number();
    let expected_number = expected_text.trim().parse::<f64>().ok();
    match (actual_number, expected_number) {
        (Some(a), Some(b)) => a.partial_cmp(&b) == Some(wanted),
        _ => actual.as_text().cmp(&expected_text) == wanted,
    }
}

fn regex_match(rule_id: &str, index: usize, actual: &FieldValue, pattern: &Value) -> bool {
    let Some(pattern_text) = value_text(pattern) else {
        return false;
    };
    let compiled = regex_cache::compiled(rule_id, index, &pattern_text);
    match compiled.as_ref() {
        Some(regex) => regex.is_match(&actual.as_text()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fields::project;
    use crate::engine::Action;
    use crate::request::test_support::RequestBuilder;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn rule(id: &str, priority: u32, action: Action, expression: Vec<Predicate>) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            description: String::new(),
            enabled: true,
            action,
            expression,
            tags: BTreeSet::new(),
            priority,
            trigger_alert: false,
            block_http_code: None,
        }
    }

    fn predicate(field: &str, operator: Operator, value: Value) -> Predicate {
        Predicate {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn sample_fields() -> FieldMap {
        project(
            &RequestBuilder::get("/api/v1/items?limit=10")
                .header("user-agent", "Mozilla/5.0")
                .meta("country", json!("DE"))
                .meta("asn", json!(64496))
                .build(),
        )
    }

    #[test]
    fn equals_is_loose_across_numbers() {
        let fields = sample_fields();
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.asn", Operator::Equals, json!("64496")),
            &fields
        ));
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.asn", Operator::Equals, json!(64496)),
            &fields
        ));
    }

    #[test]
    fn absent_field_fails_every_non_null_operator() {
        let fields = sample_fields();
        for operator in [
            Operator::Equals,
            Operator::NotEquals,
            Operator::Contains,
            Operator::NotContains,
            Operator::Matches,
            Operator::NotMatches,
            Operator::In,
            Operator::NotIn,
            Operator::GreaterThan,
            Operator::LessThan,
        ] {
            assert!(
                !predicate_matches(
                    "r",
                    0,
                    &predicate("request.cf.city", operator, json!("Berlin")),
                    &fields
                ),
                "{operator:?} on an absent field must be false"
            );
        }
    }

    #[test]
    fn null_tests_observe_absence() {
        let fields = sample_fields();
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.city", Operator::IsNull, Value::Null),
            &fields
        ));
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.country", Operator::IsNotNull, Value::Null),
            &fields
        ));
    }

    #[test]
    fn unknown_vocabulary_behaves_as_absent() {
        let fields = sample_fields();
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.noSuchField", Operator::IsNull, Value::Null),
            &fields
        ));
        assert!(!predicate_matches(
            "r",
            0,
            &predicate("request.cf.noSuchField", Operator::Equals, json!("x")),
            &fields
        ));
    }

    #[test]
    fn contains_requires_string_field() {
        let fields = sample_fields();
        assert!(predicate_matches(
            "r",
            0,
            &predicate(
                "request.headers.user-agent",
                Operator::Contains,
                json!("Mozilla")
            ),
            &fields
        ));
        // asn projects as a number; contains is defined only over strings.
        assert!(!predicate_matches(
            "r",
            0,
            &predicate("request.cf.asn", Operator::Contains, json!("64")),
            &fields
        ));
    }

    #[test]
    fn membership_uses_loose_equality() {
        let fields = sample_fields();
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.country", Operator::In, json!(["NL", "DE"])),
            &fields
        ));
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.asn", Operator::In, json!([64495, 64496])),
            &fields
        ));
        assert!(!predicate_matches(
            "r",
            0,
            &predicate("request.cf.country", Operator::In, json!("DE")),
            &fields
        ));
    }

    #[test]
    fn comparisons_prefer_numbers_then_fall_back_to_text() {
        let fields = project(
            &RequestBuilder::get("/")
                .meta("botManagement", json!({"score": 30}))
                .meta("colo", json!("AMS"))
                .build(),
        );
        assert!(predicate_matches(
            "r",
            0,
            &predicate(
                "request.cf.botManagement.score",
                Operator::GreaterThan,
                json!(29)
            ),
            &fields
        ));
        assert!(!predicate_matches(
            "r",
            0,
            &predicate(
                "request.cf.botManagement.score",
                Operator::GreaterThan,
                json!("30")
            ),
            &fields
        ));
        // Lexicographic when either side is non-numeric.
        assert!(predicate_matches(
            "r",
            0,
            &predicate("request.cf.colo", Operator::LessThan, json!("FRA")),
            &fields
        ));
    }

    #[test]
    fn invalid_regex_never_matches_and_never_panics() {
        let fields = sample_fields();
        assert!(!predicate_matches(
            "r-bad-regex",
            0,
            &predicate("request.headers.user-agent", Operator::Matches, json!("(")),
            &fields
        ));
        // The negated form still reports "did not match".
        assert!(predicate_matches(
            "r-bad-regex",
            1,
            &predicate(
                "request.headers.user-agent",
                Operator::NotMatches,
                json!("(")
            ),
            &fields
        ));
    }

    #[test]
    fn regex_matching_is_case_insensitive() {
        let fields = sample_fields();
        assert!(predicate_matches(
            "r-ci",
            0,
            &predicate(
                "request.headers.user-agent",
                Operator::Matches,
                json!("^mozilla")
            ),
            &fields
        ));
    }

    #[test]
    fn empty_expression_matches_everything() {
        let fields = sample_fields();
        assert!(expression_matches("r", &[], &fields));
    }

    #[test]
    fn expression_short_circuits_on_first_false() {
        let fields = sample_fields();
        let predicates = vec![
            predicate("request.cf.country", Operator::Equals, json!("FR")),
            predicate("request.method", Operator::Equals, json!("GET")),
        ];
        assert!(!expression_matches("r", &predicates, &fields));
    }

    #[test]
    fn first_match_by_priority_wins() {
        let fields = sample_fields();
        let rules = vec![
            rule("late", 9, Action::Block, vec![]),
            rule("early", 2, Action::Allow, vec![]),
        ];
        let outcome = evaluate_rules(&rules, &fields);
        assert_eq!(
            outcome,
            Outcome::Match {
                action: Action::Allow,
                rule_id: "early".to_string(),
                block_http_code: None,
            }
        );
    }

    #[test]
    fn priority_tie_breaks_on_id() {
        let fields = sample_fields();
        let rules = vec![
            rule("b", 5, Action::Block, vec![]),
            rule("a", 5, Action::Allow, vec![]),
        ];
        match evaluate_rules(&rules, &fields) {
            Outcome::Match { rule_id, .. } => assert_eq!(rule_id, "a"),
            Outcome::NoMatch => panic!("expected a match"),
        }
    }

    #[test]
    fn disabled_rules_are_invisible() {
        let fields = sample_fields();
        let mut blocked = rule("only", 1, Action::Block, vec![]);
        blocked.enabled = false;
        assert_eq!(evaluate_rules(&[blocked], &fields), Outcome::NoMatch);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let fields = sample_fields();
        let rules = vec![
            rule(
                "country",
                1,
                Action::Block,
                vec![predicate(
                    "request.cf.country",
                    Operator::Equals,
                    json!("DE"),
                )],
            ),
            rule("fallthrough", 2, Action::Allow, vec![]),
        ];
        let first = evaluate_rules(&rules, &fields);
        let second = evaluate_rules(&rules, &fields);
        assert_eq!(first, second);
    }

    #[test]
    fn match_carries_block_http_code() {
        let fields = sample_fields();
        let mut teapot = rule("teapot", 1, Action::Block, vec![]);
        teapot.block_http_code = Some(429);
        match evaluate_rules(&[teapot], &fields) {
            Outcome::Match {
                block_http_code, ..
            } => assert_eq!(block_http_code, Some(429)),
            Outcome::NoMatch => panic!("expected a match"),
        }
    }
}
