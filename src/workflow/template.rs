//! Parameter templates
//!
//! String parameters may reference run variables with `${path}`, where `path`
//! is a dotted walk through objects and array indices (`${items.0.name}`).
//! `$${` produces a literal `${`.
//!
//! A string is parsed once into a [`ParamExpr`] and resolved at execution
//! time. A string that is exactly one reference keeps the JSON type of the
//! value; anything mixed with text becomes a string. References that do not
//! resolve are left in place as their literal `${...}` text.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde_json::Value as JsonValue;

use crate::types::Variables;

#[derive(Parser)]
#[grammar = "workflow/template.pest"]
struct TemplateParser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamExpr {
    Literal(String),
    Variable(Vec<String>),
    Concat(Vec<ParamExpr>),
}

impl ParamExpr {
    /// Parse a template string. Text that does not parse is kept as a literal.
    pub fn parse(source: &str) -> ParamExpr {
        if !source.contains("${") {
            return ParamExpr::Literal(source.to_string());
        }

        let pairs = match TemplateParser::parse(Rule::template, source) {
            Ok(mut pairs) => match pairs.next() {
                Some(template) => template.into_inner(),
                None => return ParamExpr::Literal(source.to_string()),
            },
            Err(e) => {
                tracing::trace!(template = source, error = %e, "template kept as literal");
                return ParamExpr::Literal(source.to_string());
            }
        };

        let mut parts: Vec<ParamExpr> = Vec::new();
        for pair in pairs {
            let part = match pair.as_rule() {
                Rule::escape => ParamExpr::Literal("${".to_string()),
                Rule::text => ParamExpr::Literal(pair.as_str().to_string()),
                Rule::reference => ParamExpr::Variable(build_path(pair)),
                _ => continue,
            };
            push_merged(&mut parts, part);
        }

        match parts.len() {
            0 => ParamExpr::Literal(String::new()),
            1 => parts.remove(0),
            _ => ParamExpr::Concat(parts),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, ParamExpr::Literal(_))
    }

    pub fn resolve(&self, variables: &Variables) -> JsonValue {
        match self {
            ParamExpr::Literal(text) => JsonValue::String(text.clone()),
            ParamExpr::Variable(path) => match lookup(variables, path) {
                Some(value) => value.clone(),
                None => JsonValue::String(placeholder(path)),
            },
            ParamExpr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part.resolve(variables) {
                        JsonValue::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                JsonValue::String(out)
            }
        }
    }
}

fn build_path(reference: Pair<'_, Rule>) -> Vec<String> {
    reference
        .into_inner()
        .filter(|p| p.as_rule() == Rule::path)
        .flat_map(|path| path.into_inner())
        .map(|key| key.as_str().to_string())
        .collect()
}

fn push_merged(parts: &mut Vec<ParamExpr>, part: ParamExpr) {
    if let (Some(ParamExpr::Literal(prev)), ParamExpr::Literal(next)) = (parts.last_mut(), &part) {
        prev.push_str(next);
        return;
    }
    parts.push(part);
}

fn placeholder(path: &[String]) -> String {
    format!("${{{}}}", path.join("."))
}

/* ===================== Lookup ===================== */

/// Walk `path` through the variable map
pub fn lookup<'a>(variables: &'a Variables, path: &[String]) -> Option<&'a JsonValue> {
    let (first, rest) = path.split_first()?;
    let mut current = variables.get(first)?;
    for segment in rest {
        current = step_into(current, segment)?;
    }
    Some(current)
}

/// Walk a dotted path through any JSON value. An empty path returns the value.
pub fn lookup_dotted<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |current, segment| step_into(current, segment))
}

fn step_into<'a>(value: &'a JsonValue, segment: &str) -> Option<&'a JsonValue> {
    match value {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/* ===================== Resolution ===================== */

/// Resolve every template string inside a JSON value, recursively
pub fn resolve_value(value: &JsonValue, variables: &Variables) -> JsonValue {
    match value {
        JsonValue::String(s) => ParamExpr::parse(s).resolve(variables),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| resolve_value(v, variables)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Merge operator defaults with step parameters (step keys win) and resolve
pub fn resolve_parameters(
    defaults: &Variables,
    overrides: &Variables,
    variables: &Variables,
) -> JsonValue {
    let mut merged = defaults.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    resolve_value(&JsonValue::Object(merged), variables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: JsonValue) -> Variables {
        match value {
            JsonValue::Object(map) => map,
            _ => Variables::new(),
        }
    }

    fn path(p: &str) -> ParamExpr {
        ParamExpr::Variable(p.split('.').map(str::to_string).collect())
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(ParamExpr::parse("plain"), ParamExpr::Literal("plain".into()));
        assert_eq!(ParamExpr::parse("${user.name}"), path("user.name"));
        assert_eq!(ParamExpr::parse("${ spaced }"), path("spaced"));
        assert_eq!(
            ParamExpr::parse("Hello ${name}!"),
            ParamExpr::Concat(vec![
                ParamExpr::Literal("Hello ".into()),
                path("name"),
                ParamExpr::Literal("!".into()),
            ])
        );
    }

    #[test]
    fn test_escape_and_malformed_are_literal() {
        assert_eq!(ParamExpr::parse("cost: $${price}"), ParamExpr::Literal("cost: ${price}".into()));
        assert_eq!(ParamExpr::parse("${}"), ParamExpr::Literal("${}".into()));
        assert_eq!(ParamExpr::parse("${unterminated"), ParamExpr::Literal("${unterminated".into()));
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let v = vars(json!({"count": 3, "items": [{"name": "a"}, {"name": "b"}]}));
        assert_eq!(ParamExpr::parse("${count}").resolve(&v), json!(3));
        assert_eq!(ParamExpr::parse("${items.1.name}").resolve(&v), json!("b"));
        assert_eq!(ParamExpr::parse("${items}").resolve(&v), json!([{"name": "a"}, {"name": "b"}]));
    }

    #[test]
    fn test_mixed_text_concatenates() {
        let v = vars(json!({"base": "https://x.test", "page": 2}));
        assert_eq!(
            ParamExpr::parse("${base}/list?page=${page}").resolve(&v),
            json!("https://x.test/list?page=2")
        );
    }

    #[test]
    fn test_unresolved_reference_passes_through() {
        let v = vars(json!({"a": {"b": 1}}));
        assert_eq!(ParamExpr::parse("${a.c}").resolve(&v), json!("${a.c}"));
        assert_eq!(ParamExpr::parse("x=${missing}").resolve(&v), json!("x=${missing}"));
    }

    #[test]
    fn test_resolve_parameters_merges_and_recurses() {
        let defaults = vars(json!({"method": "GET", "retries": 1}));
        let step = vars(json!({"retries": 3, "headers": {"auth": "${token}"}, "ids": ["${id}"]}));
        let v = vars(json!({"token": "t0k", "id": 7}));

        let resolved = resolve_parameters(&defaults, &step, &v);
        assert_eq!(
            resolved,
            json!({"method": "GET", "retries": 3, "headers": {"auth": "t0k"}, "ids": [7]})
        );
    }

    #[test]
    fn test_lookup_dotted() {
        let value = json!({"data": {"rows": [10, 20]}});
        assert_eq!(lookup_dotted(&value, "data.rows.1"), Some(&json!(20)));
        assert_eq!(lookup_dotted(&value, ""), Some(&value));
        assert_eq!(lookup_dotted(&value, "data.nope"), None);
    }
}
