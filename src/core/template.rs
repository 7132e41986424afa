//! Parameter templating for chain steps.
//!
//! Step parameters may embed `{{source.path}}` tokens, where `source`
//! is either `input` (the chain input) or the id of a causally
//! preceding step, and `path` is a dot-separated lookup into that
//! value (object keys or array indices).
//!
//! An unresolved token is a hard validation error raised before
//! dispatch. Tokens are never passed through as literal strings.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::DefinitionError;

/// Root a token resolves against.
pub const INPUT_ROOT: &str = "input";

/// A parsed `{{source.path}}` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// `input` or a step id
    pub root: String,

    /// Remaining dot-separated segments, possibly empty
    pub path: Vec<String>,

    /// Original text between the braces
    pub raw: String,
}

impl Token {
    fn parse(raw: &str) -> Self {
        let mut parts = raw.split('.');
        let root = parts.next().unwrap_or_default().trim().to_string();
        let path = parts.map(|p| p.trim().to_string()).collect();
        Self {
            root,
            path,
            raw: raw.to_string(),
        }
    }
}

/// Extract every token referenced anywhere inside a parameter value.
pub fn tokens(value: &Value) -> Vec<Token> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<Token>) {
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("{{") {
                let Some(end) = rest[start + 2..].find("}}") else {
                    break;
                };
                let raw = &rest[start + 2..start + 2 + end];
                found.push(Token::parse(raw));
                rest = &rest[start + 2 + end + 2..];
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, found);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, found);
            }
        }
        _ => {}
    }
}

/// Resolution context: the chain input plus outputs of finished steps.
pub struct TemplateContext<'a> {
    input: &'a Value,
    outputs: &'a HashMap<String, Value>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(input: &'a Value, outputs: &'a HashMap<String, Value>) -> Self {
        Self { input, outputs }
    }

    fn lookup(&self, step_id: &str, token: &Token) -> Result<Value, DefinitionError> {
        let base = if token.root == INPUT_ROOT {
            self.input
        } else {
            self.outputs
                .get(&token.root)
                .ok_or_else(|| DefinitionError::UnresolvedReference {
                    step: step_id.to_string(),
                    reference: token.root.clone(),
                })?
        };

        let mut current = base;
        for segment in &token.path {
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|idx| items.get(idx)),
                _ => None,
            }
            .ok_or_else(|| DefinitionError::BadPath {
                root: token.root.clone(),
                path: token.raw.clone(),
            })?;
        }
        Ok(current.clone())
    }
}

/// Resolve every token in `params` against the context.
///
/// A string that is exactly one token takes the looked-up value with
/// its type preserved; a string mixing tokens with literal text gets
/// scalar substitution.
pub fn resolve(
    step_id: &str,
    params: &Value,
    ctx: &TemplateContext<'_>,
) -> Result<Value, DefinitionError> {
    match params {
        Value::String(s) => resolve_string(step_id, s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(step_id, item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve(step_id, item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    step_id: &str,
    s: &str,
    ctx: &TemplateContext<'_>,
) -> Result<Value, DefinitionError> {
    let trimmed = s.trim();
    if trimmed.starts_with("{{")
        && trimmed.ends_with("}}")
        && !trimmed[2..trimmed.len() - 2].contains("{{")
    {
        // Whole-token string: preserve the looked-up type
        let token = Token::parse(&trimmed[2..trimmed.len() - 2]);
        return ctx.lookup(step_id, &token);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let token = Token::parse(&rest[start + 2..start + 2 + end]);
        let value = ctx.lookup(step_id, &token)?;
        match value {
            Value::String(v) => out.push_str(&v),
            scalar => out.push_str(&scalar.to_string()),
        }
        rest = &rest[start + 2 + end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_extraction() {
        let params = json!({
            "symbol": "{{input.ticker}}",
            "note": "see {{fetch.summary}} above",
            "nested": {"deep": ["{{score.value}}"]}
        });

        let mut roots: Vec<String> = tokens(&params).into_iter().map(|t| t.root).collect();
        roots.sort();
        assert_eq!(roots, vec!["fetch", "input", "score"]);
    }

    #[test]
    fn test_whole_token_preserves_type() {
        let input = json!({"ticker": "AAPL", "limits": [1, 2, 3]});
        let outputs = HashMap::new();
        let ctx = TemplateContext::new(&input, &outputs);

        let resolved = resolve("s", &json!("{{input.limits}}"), &ctx).unwrap();
        assert_eq!(resolved, json!([1, 2, 3]));
    }

    #[test]
    fn test_embedded_token_substitutes() {
        let input = json!({"ticker": "AAPL"});
        let mut outputs = HashMap::new();
        outputs.insert("score".to_string(), json!({"value": 7}));
        let ctx = TemplateContext::new(&input, &outputs);

        let resolved = resolve(
            "s",
            &json!("rating for {{input.ticker}}: {{score.value}}"),
            &ctx,
        )
        .unwrap();
        assert_eq!(resolved, json!("rating for AAPL: 7"));
    }

    #[test]
    fn test_unresolved_root_is_hard_error() {
        let input = json!({});
        let outputs = HashMap::new();
        let ctx = TemplateContext::new(&input, &outputs);

        let err = resolve("stepB", &json!("{{missing.output}}"), &ctx).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnresolvedReference {
                step: "stepB".to_string(),
                reference: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_bad_path_is_hard_error() {
        let input = json!({"ticker": "AAPL"});
        let outputs = HashMap::new();
        let ctx = TemplateContext::new(&input, &outputs);

        let err = resolve("s", &json!("{{input.nope.deeper}}"), &ctx).unwrap_err();
        assert!(matches!(err, DefinitionError::BadPath { .. }));
    }

    #[test]
    fn test_array_index_path() {
        let input = json!({"rows": [{"id": "a"}, {"id": "b"}]});
        let outputs = HashMap::new();
        let ctx = TemplateContext::new(&input, &outputs);

        let resolved = resolve("s", &json!("{{input.rows.1.id}}"), &ctx).unwrap();
        assert_eq!(resolved, json!("b"));
    }

    #[test]
    fn test_non_token_braces_left_alone() {
        let input = json!({});
        let outputs = HashMap::new();
        let ctx = TemplateContext::new(&input, &outputs);

        // An opening without a close is not a token
        let resolved = resolve("s", &json!("a {{ dangling"), &ctx).unwrap();
        assert_eq!(resolved, json!("a {{ dangling"));
    }
}
