/// Condition expressions for branch, while-loop and break conditions
///
/// An expression is `lhs OP rhs` or a single operand tested for truthiness.
/// Operands may be placeholders (typed), quoted strings, numbers, `true`,
/// `false`, `null`, JSON literals or bare words. An expression that starts
/// with an operator, such as `> 10`, compares the node input on the left.

use crate::runtime::context::ExecutionContext;
use crate::runtime::error::ConfigResolutionError;
use crate::runtime::template;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    StrictEq,
    StrictNe,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

/// Longest tokens first so `===` wins over `==`
const OPERATORS: &[(&str, Operator)] = &[
    ("===", Operator::StrictEq),
    ("!==", Operator::StrictNe),
    ("==", Operator::Eq),
    ("!=", Operator::Ne),
    ("<=", Operator::Le),
    (">=", Operator::Ge),
    ("<", Operator::Lt),
    (">", Operator::Gt),
];

/// Find the first operator outside quotes and placeholders
fn find_operator(expression: &str) -> Option<(usize, &'static str, Operator)> {
    let bytes = expression.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut position = 0;
    while position < bytes.len() {
        let byte = bytes[position];
        if let Some(open) = quote {
            if byte == open {
                quote = None;
            }
            position += 1;
            continue;
        }
        let rest = &bytes[position..];
        if rest.starts_with(b"{{") {
            depth += 1;
            position += 2;
            continue;
        }
        if depth > 0 && rest.starts_with(b"}}") {
            depth -= 1;
            position += 2;
            continue;
        }
        if depth == 0 {
            if byte == b'"' || byte == b'\'' {
                quote = Some(byte);
            } else if let Some((token, op)) = OPERATORS
                .iter()
                .find(|(token, _)| rest.starts_with(token.as_bytes()))
            {
                return Some((position, *token, *op));
            }
        }
        position += 1;
    }
    None
}

/// Parse a literal operand
pub fn parse_operand(text: &str) -> Value {
    let text = text.trim();
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "undefined" => return Value::Null,
        _ => {}
    }
    let quoted = text.len() >= 2
        && ((text.starts_with('"') && text.ends_with('"'))
            || (text.starts_with('\'') && text.ends_with('\'')));
    if quoted {
        return Value::String(text[1..text.len() - 1].to_string());
    }
    if let Ok(number) = text.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(number) {
            return Value::Number(number);
        }
    }
    if text.starts_with('{') || text.starts_with('[') {
        if let Ok(value) = serde_json::from_str(text) {
            return value;
        }
    }
    Value::String(text.to_string())
}

fn operand(text: &str, ctx: &ExecutionContext) -> Result<Value, ConfigResolutionError> {
    let trimmed = text.trim();
    if template::contains_placeholder(trimmed) {
        let resolved = template::resolve_str(trimmed, ctx)?;
        return Ok(match resolved {
            // Embedded placeholders produce text that may itself be a literal
            Value::String(s) if !is_single_placeholder(trimmed) => parse_operand(&s),
            other => other,
        });
    }
    Ok(parse_operand(trimmed))
}

fn is_single_placeholder(text: &str) -> bool {
    text.starts_with("{{") && text.ends_with("}}") && text.matches("{{").count() == 1
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// JavaScript-like truthiness
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn strict_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_equal(left: &Value, right: &Value) -> bool {
    if strict_equal(left, right) {
        return true;
    }
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    template::stringify(left) == template::stringify(right)
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(template::stringify(left).cmp(&template::stringify(right))),
    }
}

/// Apply a comparison operator to two values
pub fn compare(left: &Value, op: Operator, right: &Value) -> bool {
    match op {
        Operator::StrictEq => strict_equal(left, right),
        Operator::StrictNe => !strict_equal(left, right),
        Operator::Eq => loose_equal(left, right),
        Operator::Ne => !loose_equal(left, right),
        Operator::Lt => order(left, right) == Some(Ordering::Less),
        Operator::Gt => order(left, right) == Some(Ordering::Greater),
        Operator::Le => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        Operator::Ge => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
    }
}

/// Evaluate a condition expression in `ctx`, with `input` as the implicit left side
pub fn evaluate(
    expression: &str,
    ctx: &ExecutionContext,
    input: &Value,
) -> Result<bool, ConfigResolutionError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(ConfigResolutionError::Malformed {
            template: expression.to_string(),
            reason: "empty condition".to_string(),
        });
    }

    let Some((position, token, op)) = find_operator(expression) else {
        return Ok(truthy(&operand(expression, ctx)?));
    };

    let lhs_text = &expression[..position];
    let rhs_text = &expression[position + token.len()..];
    if rhs_text.trim().is_empty() {
        return Err(ConfigResolutionError::Malformed {
            template: expression.to_string(),
            reason: format!("missing right operand after '{}'", token),
        });
    }

    let left = if lhs_text.trim().is_empty() {
        input.clone()
    } else {
        operand(lhs_text, ctx)?
    };
    let right = operand(rhs_text, ctx)?;
    Ok(compare(&left, op, &right))
}
