use regex::RegexBuilder;
use rusqlite::params;
use serde_json::Value;

use super::{db, AuditRecord, StoreError, TenantStore};
use crate::engine::{is_known_field, Operator, Predicate, Rule};

impl TenantStore {
    /// Inserts a new rule. Priority must sit in `1..=max(enabled)+1` and must
    /// not collide with another enabled rule.
    pub async fn create_rule(&self, actor: &str, mut rule: Rule) -> Result<Rule, StoreError> {
        rule.id = rule.id.trim().to_string();
        validate_rule(&rule)?;

        let stored = rule.clone();
        self.write(move |conn| {
            let tx = conn.transaction()?;
            if db::load_rule(&tx, &stored.id)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "rule '{}' already exists",
                    stored.id
                )));
            }
            check_priority_admission(&tx, &stored, None)?;
            db::insert_rule(&tx, &stored)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "rule.create",
            &rule.id,
            None,
            Some(rule_json(&rule)),
        ))
        .await;
        Ok(rule)
    }

    /// Full replace of an existing rule; the path id is authoritative.
    pub async fn update_rule(
        &self,
        actor: &str,
        id: &str,
        mut rule: Rule,
    ) -> Result<Rule, StoreError> {
        rule.id = id.to_string();
        validate_rule(&rule)?;

        let stored = rule.clone();
        let before = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let Some(before) = db::load_rule(&tx, &stored.id)? else {
                    return Err(StoreError::NotFound(format!("rule '{}'", stored.id)));
                };
                check_priority_admission(&tx, &stored, Some(&stored.id))?;
                db::replace_rule(&tx, &stored)?;
                tx.commit()?;
                Ok(before)
            })
            .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "rule.update",
            id,
            Some(rule_json(&before)),
            Some(rule_json(&rule)),
        ))
        .await;
        Ok(rule)
    }

    pub async fn delete_rule(&self, actor: &str, id: &str) -> Result<(), StoreError> {
        let target = id.to_string();
        let before = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let Some(before) = db::load_rule(&tx, &target)? else {
                    return Err(StoreError::NotFound(format!("rule '{target}'")));
                };
                tx.execute("DELETE FROM rules WHERE id = ?1", params![target])?;
                tx.commit()?;
                Ok(before)
            })
            .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "rule.delete",
            id,
            Some(rule_json(&before)),
            None,
        ))
        .await;
        Ok(())
    }

    /// Atomically re-densifies enabled priorities to `1..N` in the order of
    /// `active_ids`. The list must name every enabled rule exactly once.
    pub async fn reorder(&self, actor: &str, active_ids: Vec<String>) -> Result<(), StoreError> {
        let requested = active_ids.clone();
        self.write(move |conn| {
            let tx = conn.transaction()?;
            let enabled: Vec<String> = db::load_rules(&tx)?
                .into_iter()
                .filter(|rule| rule.enabled)
                .map(|rule| rule.id)
                .collect();

            if requested.len() != enabled.len() {
                return Err(StoreError::InvalidInput(format!(
                    "reorder must name all {} enabled rules, got {}",
                    enabled.len(),
                    requested.len()
                )));
            }
            for id in &requested {
                if !enabled.iter().any(|enabled_id| enabled_id == id) {
                    return Err(StoreError::InvalidInput(format!(
                        "rule '{id}' is not an enabled rule of this tenant"
                    )));
                }
            }
            let mut seen = std::collections::HashSet::new();
            for id in &requested {
                if !seen.insert(id) {
                    return Err(StoreError::InvalidInput(format!(
                        "rule '{id}' listed more than once"
                    )));
                }
            }

            for (index, id) in requested.iter().enumerate() {
                tx.execute(
                    "UPDATE rules SET priority = ?2 WHERE id = ?1",
                    params![id, (index + 1) as u32],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "rule.reorder",
            "rules",
            None,
            Some(Value::Array(
                active_ids.into_iter().map(Value::String).collect(),
            )),
        ))
        .await;
        Ok(())
    }
}

fn rule_json(rule: &Rule) -> Value {
    serde_json::to_value(rule).unwrap_or(Value::Null)
}

fn validate_rule(rule: &Rule) -> Result<(), StoreError> {
    if rule.id.is_empty() {
        return Err(StoreError::InvalidInput("rule id must not be empty".into()));
    }
    if rule
        .id
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == '?')
    {
        return Err(StoreError::InvalidInput(format!(
            "rule id '{}' contains reserved characters",
            rule.id
        )));
    }
    if rule.name.trim().is_empty() {
        return Err(StoreError::InvalidInput(
            "rule name must not be empty".into(),
        ));
    }
    if rule.priority == 0 {
        return Err(StoreError::InvalidInput(
            "rule priority must be greater than 0".into(),
        ));
    }
    if let Some(code) = rule.block_http_code {
        if !(100..=599).contains(&code) {
            return Err(StoreError::InvalidInput(format!(
                "block_http_code {code} is not an HTTP status"
            )));
        }
    }
    validate_expression(&rule.expression)
}

fn validate_expression(predicates: &[Predicate]) -> Result<(), StoreError> {
    for (index, predicate) in predicates.iter().enumerate() {
        if !is_known_field(&predicate.field) {
            return Err(StoreError::InvalidInput(format!(
                "predicate {index}: unknown field '{}'",
                predicate.field
            )));
        }
        match predicate.operator {
            Operator::Matches | Operator::NotMatches => {
                let Value::String(pattern) = &predicate.value else {
                    return Err(StoreError::InvalidInput(format!(
                        "predicate {index}: regex operators take a string pattern"
                    )));
                };
                // Stored rules with patterns that later fail to compile still
                // evaluate safely to false; new ones are rejected up front.
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| {
                        StoreError::InvalidInput(format!(
                            "predicate {index}: invalid regex: {err}"
                        ))
                    })?;
            }
            Operator::In | Operator::NotIn => {
                if !predicate.value.is_array() {
                    return Err(StoreError::InvalidInput(format!(
                        "predicate {index}: membership operators take a list"
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Shared create/update admission check: priority within `1..=max+1` and no
/// collision among enabled rules. `exclude` skips the rule being replaced.
fn check_priority_admission(
    conn: &rusqlite::Connection,
    rule: &Rule,
    exclude: Option<&str>,
) -> Result<(), StoreError> {
    let rules = db::load_rules(conn)?;
    let max_enabled = rules
        .iter()
        .filter(|existing| existing.enabled && Some(existing.id.as_str()) != exclude)
        .map(|existing| existing.priority)
        .max()
        .unwrap_or(0);
    if rule.priority > max_enabled + 1 {
        return Err(StoreError::InvalidInput(format!(
            "priority {} exceeds max enabled priority + 1 ({})",
            rule.priority,
            max_enabled + 1
        )));
    }
    if rule.enabled {
        if let Some(holder) = rules.iter().find(|existing| {
            existing.enabled
                && existing.priority == rule.priority
                && Some(existing.id.as_str()) != exclude
        }) {
            return Err(StoreError::InvalidInput(format!(
                "priority {} is already held by enabled rule '{}'",
                rule.priority, holder.id
            )));
        }
    }
    Ok(())
}
