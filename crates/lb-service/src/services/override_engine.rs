//! Per-tenant rewriting of create parameters.
//!
//! [`apply`] interprets a tenant's rules in definition order against a copy
//! of the incoming parameters. It has no side effects and never suspends.

use crate::errors::LbError;
use crate::models::{OverrideOp, OverrideRule, Params};

/// Apply `rules` in order to `params`, returning the rewritten parameters.
///
/// A numeric-max rule meeting a non-integer parameter value fails the whole
/// application with `Validation`; no partial result is returned.
pub fn apply(rules: &[OverrideRule], params: &Params) -> Result<Params, LbError> {
    let mut out = params.clone();

    for rule in rules {
        match rule.op {
            OverrideOp::ForceSet => {
                if rule.value.is_empty() {
                    out.remove(&rule.parameter);
                } else {
                    out.insert(rule.parameter.clone(), rule.value.clone());
                }
            }
            OverrideOp::Fallback => {
                out.entry(rule.parameter.clone())
                    .or_insert_with(|| rule.value.clone());
            }
            OverrideOp::NumericMax => {
                if let Some(current) = out.get_mut(&rule.parameter) {
                    let limit = parse_integer(&rule.parameter, &rule.value)?;
                    let value = parse_integer(&rule.parameter, current)?;
                    if value > limit {
                        *current = limit.to_string();
                    }
                }
            }
            OverrideOp::ListAppend => {
                let item = rule.value.trim();
                if item.is_empty() {
                    continue;
                }
                out.entry(rule.parameter.clone())
                    .and_modify(|current| *current = append_unique(current, item))
                    .or_insert_with(|| item.to_string());
            }
        }
    }

    Ok(out)
}

fn parse_integer(parameter: &str, value: &str) -> Result<i64, LbError> {
    value.trim().parse::<i64>().map_err(|_| {
        LbError::Validation(format!(
            "Parameter '{parameter}' must be an integer, got '{value}'"
        ))
    })
}

/// Add `item` to a comma-separated set, dropping empty and duplicate entries.
fn append_unique(list: &str, item: &str) -> String {
    let mut items: Vec<&str> = Vec::new();
    for existing in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !items.contains(&existing) {
            items.push(existing);
        }
    }
    if !items.contains(&item) {
        items.push(item);
    }
    items.join(",")
}
