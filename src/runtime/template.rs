/// Template resolver
///
/// Turns node configuration containing `{{ source.path }}` placeholders into
/// concrete values. A string that is exactly one placeholder keeps the referenced
/// value's JSON type; placeholders embedded in longer text are stringified.
///
/// Sources, in lookup order: scope locals (`input`, `item`, `index`, loop state,
/// mapped inputs), `credential.<name>`, `env.<NAME>`, then prior node outputs by
/// node id. A reference that cannot be followed is an error, never `null`.

use crate::runtime::context::ExecutionContext;
use crate::runtime::error::ConfigResolutionError;
use serde_json::{Map, Value};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Config keys that hold nested definitions or policies and are never resolved
/// by the generic pass
pub const PASSTHROUGH_KEYS: &[&str] = &[
    "nodes",
    "connections",
    "branches",
    "protected",
    "fallbackConfig",
    "retry",
    "onErrorWebhook",
    "conditions",
    "condition",
    "breakCondition",
    "stateUpdates",
    "resultSource",
    "outputSource",
    "outputMapping",
];

#[derive(Debug, PartialEq)]
enum Piece<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// One step of a placeholder path
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

/// True if the string contains at least one `{{`
pub fn contains_placeholder(text: &str) -> bool {
    text.contains(OPEN)
}

fn split_pieces(template: &str) -> Result<Vec<Piece<'_>>, ConfigResolutionError> {
    let mut pieces = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            pieces.push(Piece::Text(&rest[..start]));
        }
        let after_open = &rest[start + OPEN.len()..];
        let end = after_open
            .find(CLOSE)
            .ok_or_else(|| ConfigResolutionError::Malformed {
                template: template.to_string(),
                reason: "unterminated '{{'".to_string(),
            })?;
        pieces.push(Piece::Placeholder(&after_open[..end]));
        rest = &after_open[end + CLOSE.len()..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

fn malformed(placeholder: &str, reason: &str) -> ConfigResolutionError {
    ConfigResolutionError::Malformed {
        template: format!("{{{{{}}}}}", placeholder),
        reason: reason.to_string(),
    }
}

/// Split `source.a[0]["k"]` into the source name and its path segments
fn parse_reference(expression: &str) -> Result<(String, Vec<Segment>), ConfigResolutionError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(malformed(expression, "empty placeholder"));
    }

    let chars: Vec<char> = expression.chars().collect();
    let mut position = 0;
    let mut head = String::new();
    while position < chars.len() && chars[position] != '.' && chars[position] != '[' {
        head.push(chars[position]);
        position += 1;
    }
    if head.trim().is_empty() {
        return Err(malformed(expression, "missing source name"));
    }

    let mut segments = Vec::new();
    while position < chars.len() {
        match chars[position] {
            '.' => {
                position += 1;
                let mut key = String::new();
                while position < chars.len() && chars[position] != '.' && chars[position] != '[' {
                    key.push(chars[position]);
                    position += 1;
                }
                if key.is_empty() {
                    return Err(malformed(expression, "empty path segment"));
                }
                segments.push(Segment::Key(key));
            }
            '[' => {
                position += 1;
                let close = chars[position..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| malformed(expression, "unterminated '['"))?;
                let inner: String = chars[position..position + close].iter().collect();
                position += close + 1;
                let inner = inner.trim();
                let quoted = inner.len() >= 2
                    && ((inner.starts_with('"') && inner.ends_with('"'))
                        || (inner.starts_with('\'') && inner.ends_with('\'')));
                if quoted {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| malformed(expression, "bracket index must be a number or quoted key"))?;
                    segments.push(Segment::Index(index));
                }
            }
            _ => return Err(malformed(expression, "unexpected character in path")),
        }
    }
    Ok((head.trim().to_string(), segments))
}

fn traverse(
    mut current: &Value,
    segments: &[Segment],
    placeholder: &str,
) -> Result<Value, ConfigResolutionError> {
    for segment in segments {
        let next = match (current, segment) {
            (Value::Object(map), Segment::Key(key)) => map.get(key),
            (Value::Array(items), Segment::Index(index)) => items.get(*index),
            // `items.0` is accepted as an alias for `items[0]`
            (Value::Array(items), Segment::Key(key)) => {
                key.parse::<usize>().ok().and_then(|index| items.get(index))
            }
            _ => None,
        };
        current = next.ok_or_else(|| ConfigResolutionError::MissingPath {
            placeholder: placeholder.to_string(),
            segment: segment.to_string(),
        })?;
    }
    Ok(current.clone())
}

fn first_key(segments: &[Segment], placeholder: &str) -> Result<String, ConfigResolutionError> {
    match segments.first() {
        Some(Segment::Key(name)) => Ok(name.clone()),
        _ => Err(malformed(placeholder, "expected a name after the source")),
    }
}

/// Resolve the content of one placeholder to a typed value
pub fn lookup(expression: &str, ctx: &ExecutionContext) -> Result<Value, ConfigResolutionError> {
    let placeholder = expression.trim();
    let (head, segments) = parse_reference(placeholder)?;

    if let Some(value) = ctx.local(&head) {
        if ctx.has_output(&head) {
            tracing::warn!(
                "⚠️ Placeholder '{}' reads scope variable '{}', which shadows the node of the same id",
                placeholder,
                head
            );
        }
        return traverse(value, &segments, placeholder);
    }

    match head.as_str() {
        "credential" | "credentials" => {
            let name = first_key(&segments, placeholder)?;
            let secret = ctx
                .credential(&name)
                .ok_or_else(|| ConfigResolutionError::MissingCredential(name.clone()))?;
            traverse(&Value::String(secret.to_string()), &segments[1..], placeholder)
        }
        "env" => {
            let name = first_key(&segments, placeholder)?;
            let value = ctx
                .env(&name)
                .ok_or_else(|| ConfigResolutionError::MissingEnv(name.clone()))?;
            traverse(&Value::String(value.to_string()), &segments[1..], placeholder)
        }
        _ => match ctx.output(&head) {
            Some(output) => traverse(output, &segments, placeholder),
            None => Err(ConfigResolutionError::UnknownSource {
                placeholder: placeholder.to_string(),
                source_name: head,
            }),
        },
    }
}

/// Text form of a value when embedded in a longer string
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve a template string
///
/// Exactly one placeholder keeps the referenced type; anything else yields a string.
pub fn resolve_str(template: &str, ctx: &ExecutionContext) -> Result<Value, ConfigResolutionError> {
    if !contains_placeholder(template) {
        return Ok(Value::String(template.to_string()));
    }
    let pieces = split_pieces(template)?;
    if let [Piece::Placeholder(expression)] = pieces.as_slice() {
        return lookup(expression, ctx);
    }

    let mut rendered = String::with_capacity(template.len());
    for piece in pieces {
        match piece {
            Piece::Text(text) => rendered.push_str(text),
            Piece::Placeholder(expression) => rendered.push_str(&stringify(&lookup(expression, ctx)?)),
        }
    }
    Ok(Value::String(rendered))
}

/// Resolve a template and always return its text form
pub fn resolve_string(template: &str, ctx: &ExecutionContext) -> Result<String, ConfigResolutionError> {
    resolve_str(template, ctx).map(|value| stringify(&value))
}

/// Recursively resolve every string in a JSON value
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Result<Value, ConfigResolutionError> {
    match value {
        Value::String(text) => resolve_str(text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_config(map, ctx, &[]).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolve a node config, copying `passthrough` keys verbatim
pub fn resolve_config(
    config: &Map<String, Value>,
    ctx: &ExecutionContext,
    passthrough: &[&str],
) -> Result<Map<String, Value>, ConfigResolutionError> {
    let mut resolved = Map::with_capacity(config.len());
    for (key, value) in config {
        let value = if passthrough.contains(&key.as_str()) {
            value.clone()
        } else {
            resolve_value(value, ctx)?
        };
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            HashMap::from([
                ("REGION".to_string(), "eu-west".to_string()),
                ("OPENAI_API_KEY".to_string(), "sk-env".to_string()),
            ]),
            HashMap::from([("stripe".to_string(), "sk_live".to_string())]),
        );
        ctx.publish(
            "fetch_user",
            json!({
                "body": { "name": "Ada", "tags": ["admin", "ops"], "a.b": 7 },
                "status": 200
            }),
            vec![],
        );
        ctx.set_local("item", json!({ "id": 42 }));
        ctx
    }

    #[test]
    fn whole_placeholder_keeps_type() {
        let ctx = context();
        assert_eq!(resolve_str("{{fetch_user.status}}", &ctx).unwrap(), json!(200));
        assert_eq!(
            resolve_str("{{ fetch_user.body.tags }}", &ctx).unwrap(),
            json!(["admin", "ops"])
        );
        assert_eq!(resolve_str("{{item.id}}", &ctx).unwrap(), json!(42));
    }

    #[test]
    fn scope_variables_shadow_node_outputs() {
        let mut ctx = context();
        ctx.publish("item", json!({ "id": 1 }), vec![]);
        assert_eq!(resolve_str("{{item.id}}", &ctx).unwrap(), json!(42));
    }

    #[test]
    fn embedded_placeholders_are_stringified() {
        let ctx = context();
        assert_eq!(
            resolve_str("Hi {{fetch_user.body.name}} ({{fetch_user.status}})", &ctx).unwrap(),
            json!("Hi Ada (200)")
        );
        assert_eq!(
            resolve_str("tags={{fetch_user.body.tags}}", &ctx).unwrap(),
            json!("tags=[\"admin\",\"ops\"]")
        );
    }

    #[test]
    fn bracket_segments_index_arrays_and_quoted_keys() {
        let ctx = context();
        assert_eq!(
            resolve_str("{{fetch_user.body.tags[1]}}", &ctx).unwrap(),
            json!("ops")
        );
        assert_eq!(
            resolve_str("{{fetch_user.body[\"a.b\"]}}", &ctx).unwrap(),
            json!(7)
        );
    }

    #[test]
    fn missing_path_is_an_error_not_null() {
        let ctx = context();
        let err = resolve_str("{{fetch_user.body.email}}", &ctx).unwrap_err();
        assert!(matches!(err, ConfigResolutionError::MissingPath { ref segment, .. } if segment == "email"));

        let err = resolve_str("{{fetch_user.body.tags[5]}}", &ctx).unwrap_err();
        assert!(matches!(err, ConfigResolutionError::MissingPath { .. }));

        let err = resolve_str("{{nobody.name}}", &ctx).unwrap_err();
        assert!(matches!(err, ConfigResolutionError::UnknownSource { ref source_name, .. } if source_name == "nobody"));
    }

    #[test]
    fn unterminated_placeholder_is_malformed() {
        let ctx = context();
        let err = resolve_str("Hello {{fetch_user.body.name", &ctx).unwrap_err();
        assert!(matches!(err, ConfigResolutionError::Malformed { .. }));
    }

    #[test]
    fn env_and_credentials() {
        let ctx = context();
        assert_eq!(resolve_str("{{env.REGION}}", &ctx).unwrap(), json!("eu-west"));
        assert_eq!(resolve_str("{{credential.stripe}}", &ctx).unwrap(), json!("sk_live"));
        assert_eq!(resolve_str("{{credential.OPENAI}}", &ctx).unwrap(), json!("sk-env"));
        assert_eq!(
            resolve_str("{{env.NOPE}}", &ctx).unwrap_err(),
            ConfigResolutionError::MissingEnv("NOPE".to_string())
        );
        assert_eq!(
            resolve_str("{{credential.github}}", &ctx).unwrap_err(),
            ConfigResolutionError::MissingCredential("github".to_string())
        );
    }

    #[test]
    fn passthrough_keys_are_copied_verbatim() {
        let ctx = context();
        let config = json!({
            "url": "https://api/{{item.id}}",
            "nodes": [{ "id": "x", "type": "logMessage", "config": { "message": "{{later.value}}" } }]
        });
        let resolved = resolve_config(config.as_object().unwrap(), &ctx, PASSTHROUGH_KEYS).unwrap();
        assert_eq!(resolved["url"], json!("https://api/42"));
        assert_eq!(resolved["nodes"], config["nodes"]);
    }

    #[test]
    fn resolution_is_idempotent() {
        let ctx = context();
        let config = json!({
            "greeting": "Hello {{fetch_user.body.name}}",
            "tags": "{{fetch_user.body.tags}}",
            "nested": [{ "region": "{{env.REGION}}" }, 3, null]
        });
        let first = resolve_value(&config, &ctx).unwrap();
        let second = resolve_value(&config, &ctx).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}
