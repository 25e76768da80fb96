//! Query token substitution.
//!
//! Replaces `$name`, `${name}` and `${name:modifier}` tokens with resolved
//! variable values, then fixed interval tokens, then appends dynamic ad-hoc
//! filter clauses. Multi-select values render according to the modifier
//! suffix (`:csv`, `:pipe`, `:doublequote`, `:singlequote`); without a
//! modifier they render comma-joined.

use crate::panel::interval::IntervalTokens;
use crate::types::{VariableInstance, VariableValue};
use std::collections::HashMap;

/// One dynamic filter clause contributed by a `dynamic_filters` variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdHocFilter {
    pub field: String,
    pub operator: String,
    pub value: String,
}

/// Values available for substitution, keyed by token name.
pub type TokenValues = HashMap<String, VariableValue>;

/// Build the substitution table from the variables a panel reads.
///
/// Later entries shadow earlier same-named ones, matching the panel-merge
/// order (global, then tab, then panel).
pub fn token_values(instances: &[&VariableInstance]) -> TokenValues {
    let mut values = TokenValues::new();
    for instance in instances {
        values.insert(instance.name.clone(), instance.value.deep_clone());
    }
    values
}

/// Interval tokens as a substitution table.
pub fn interval_token_values(tokens: &IntervalTokens) -> TokenValues {
    let mut values = TokenValues::new();
    values.insert(
        "__interval_ms".to_string(),
        VariableValue::Scalar(tokens.interval_ms.to_string()),
    );
    values.insert(
        "__interval".to_string(),
        VariableValue::Scalar(tokens.interval.clone()),
    );
    values.insert(
        "__rate_interval".to_string(),
        VariableValue::Scalar(tokens.rate_interval.clone()),
    );
    values
}

/// Replace every variable token in `query` that has a value in `values`.
///
/// Null values leave the token untouched so an unresolved reference is
/// visible downstream rather than silently blanked. Unknown names are left
/// as-is; they may be backend built-ins.
pub fn substitute_tokens(query: &str, values: &TokenValues) -> String {
    let bytes = query.as_bytes();
    let mut output = String::with_capacity(query.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            let ch_len = utf8_len(bytes[i]);
            output.push_str(&query[i..i + ch_len]);
            i += ch_len;
            continue;
        }

        // Braced form, with optional modifier.
        if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = query[i + 2..].find('}') {
                let inner = &query[i + 2..i + 2 + close];
                let mut parts = inner.splitn(2, ':');
                let name = parts.next().unwrap_or("");
                let modifier = parts.next();
                if let Some(rendered) = render_token(values, name, modifier) {
                    output.push_str(&rendered);
                    i += 2 + close + 1;
                    continue;
                }
            }
            output.push('$');
            i += 1;
            continue;
        }

        // Bare form: maximal name token.
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && is_name_byte(bytes[end]) {
            end += 1;
        }
        if end > start {
            if let Some(rendered) = render_token(values, &query[start..end], None) {
                output.push_str(&rendered);
                i = end;
                continue;
            }
        }
        output.push('$');
        i += 1;
    }

    output
}

fn render_token(values: &TokenValues, name: &str, modifier: Option<&str>) -> Option<String> {
    let value = values.get(name)?;
    match value {
        VariableValue::Null => None,
        VariableValue::Scalar(scalar) => Some(render_list(std::slice::from_ref(scalar), modifier)),
        VariableValue::List(items) => Some(render_list(items, modifier)),
    }
}

fn render_list(items: &[String], modifier: Option<&str>) -> String {
    match modifier {
        Some("pipe") => items.join("|"),
        Some("doublequote") => items
            .iter()
            .map(|item| format!("\"{}\"", item))
            .collect::<Vec<_>>()
            .join(","),
        Some("singlequote") => items
            .iter()
            .map(|item| format!("'{}'", item))
            .collect::<Vec<_>>()
            .join(","),
        // `csv` and no modifier both comma-join.
        _ => items.join(","),
    }
}

/// Append ad-hoc filter clauses to a query.
///
/// Structural SQL rewriting is out of scope; clauses are conjoined onto the
/// end of the query text, which the backend accepts for the stream-search
/// grammar in use here.
pub fn apply_dynamic_filters(query: &str, filters: &[AdHocFilter]) -> String {
    if filters.is_empty() {
        return query.to_string();
    }
    let clauses = filters
        .iter()
        .map(|f| format!("{} {} '{}'", f.field, f.operator, f.value))
        .collect::<Vec<_>>()
        .join(" AND ");
    if query.trim().is_empty() {
        return clauses;
    }
    format!("{} AND {}", query, clauses)
}

/// Extract ad-hoc filter clauses from `dynamic_filters` variable values.
/// Each selected value is expected as `field|operator|value`; malformed
/// entries are skipped.
pub fn dynamic_filters_from(instances: &[&VariableInstance]) -> Vec<AdHocFilter> {
    let mut filters = Vec::new();
    for instance in instances {
        if instance.kind != crate::types::VariableKind::DynamicFilters {
            continue;
        }
        for entry in instance.value.as_list() {
            let mut parts = entry.splitn(3, '|');
            let (Some(field), Some(operator), Some(value)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            filters.push(AdHocFilter {
                field: field.to_string(),
                operator: operator.to_string(),
                value: value.to_string(),
            });
        }
    }
    filters
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}
