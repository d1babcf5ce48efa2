/// Built-in capability invokers
///
/// The node vocabulary that ships with the engine:
/// - Triggers: emit the run input
/// - httpRequest / aiTask / sendEmail: outbound HTTP through a shared reqwest client
/// - databaseQuery: PostgreSQL through tokio-postgres
/// - logMessage, parseJson, delay and the text/date helpers: pure, same in every mode

use crate::runtime::error::{InvocationError, InvocationErrorKind};
use crate::runtime::invoker::{canned_response, CapabilityInvoker, InvocationRequest, InvokerRegistry};
use crate::runtime::template::stringify;
use crate::workflow::nodes::TRIGGER_TYPES;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_postgres::types::{ToSql, Type};

/// Register every built-in capability on `registry`
pub fn register_builtins(registry: &mut InvokerRegistry, http: reqwest::Client) {
    for trigger in TRIGGER_TYPES {
        registry.register(*trigger, Arc::new(TriggerInvoker));
    }
    registry.register("httpRequest", Arc::new(HttpRequestInvoker { client: http.clone() }));
    registry.register("aiTask", Arc::new(AiTaskInvoker { client: http.clone() }));
    registry.register("sendEmail", Arc::new(SendEmailInvoker { client: http }));
    registry.register("databaseQuery", Arc::new(DatabaseQueryInvoker));
    registry.register("logMessage", Arc::new(LogMessageInvoker));
    registry.register("parseJson", Arc::new(ParseJsonInvoker));
    registry.register("delay", Arc::new(DelayInvoker));
    registry.register("toUpperCase", Arc::new(TextCaseInvoker { upper: true }));
    registry.register("toLowerCase", Arc::new(TextCaseInvoker { upper: false }));
    registry.register("concatenateStrings", Arc::new(ConcatenateInvoker));
    registry.register("stringSplit", Arc::new(SplitInvoker));
    registry.register("formatDate", Arc::new(FormatDateInvoker));
}

/// Text from a config key, falling back to the node input
fn text_or_input(request: &InvocationRequest<'_>, key: &str) -> Result<String, InvocationError> {
    match request.config.get(key) {
        Some(value) if !value.is_null() => Ok(stringify(value)),
        _ if !request.input.is_null() => Ok(stringify(request.input)),
        _ => Err(InvocationError::validation(format!(
            "{} node '{}' needs '{}' or an input value",
            request.node_type, request.node_id, key
        ))),
    }
}

fn reqwest_error(context: &str, error: reqwest::Error) -> InvocationError {
    if error.is_timeout() {
        InvocationError::new(
            InvocationErrorKind::Timeout,
            format!("{}: {}", context, error),
        )
    } else if let Some(status) = error.status() {
        InvocationError::from_status(status.as_u16(), format!("{}: {}", context, error))
    } else {
        InvocationError::internal(format!("{}: {}", context, error))
    }
}

fn apply_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &Map<String, Value>,
) -> reqwest::RequestBuilder {
    for (key, value) in headers {
        builder = builder.header(key.as_str(), stringify(value));
    }
    builder
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Emits the run input; in simulate mode a configured sample request wins
struct TriggerInvoker;

#[async_trait]
impl CapabilityInvoker for TriggerInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        if request.mode.is_simulation() {
            let sample = request
                .config
                .get("simulatedRequestBody")
                .cloned()
                .or_else(|| canned_response(request.config));
            if let Some(sample) = sample {
                return Ok(sample);
            }
        }
        Ok(request.input.clone())
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// HTTP request
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Map<String, Value>,
    #[serde(default)]
    query: Map<String, Value>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Generic outbound HTTP call
struct HttpRequestInvoker {
    client: reqwest::Client,
}

#[async_trait]
impl CapabilityInvoker for HttpRequestInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let config: HttpRequestConfig = request.typed()?;
        let method = config.method.to_uppercase();
        tracing::debug!("🌍 HTTP Request: {} {}", method, config.url);

        let mut builder = match method.as_str() {
            "GET" => self.client.get(&config.url),
            "POST" => self.client.post(&config.url),
            "PUT" => self.client.put(&config.url),
            "DELETE" => self.client.delete(&config.url),
            "PATCH" => self.client.patch(&config.url),
            other => {
                return Err(InvocationError::validation(format!(
                    "unsupported HTTP method: {}",
                    other
                )))
            }
        };
        builder = apply_headers(builder, &config.headers);
        if !config.query.is_empty() {
            let query: Vec<(String, String)> = config
                .query
                .iter()
                .map(|(k, v)| (k.clone(), stringify(v)))
                .collect();
            builder = builder.query(&query);
        }
        match &config.body {
            Some(Value::String(text)) => builder = builder.body(text.clone()),
            Some(body) if !body.is_null() => builder = builder.json(body),
            _ => {}
        }

        let response = builder
            .send()
            .await
            .map_err(|e| reqwest_error("HTTP request failed", e))?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| reqwest_error("failed to read response body", e))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        tracing::debug!("📡 Response status: {}", status);
        if !status.is_success() {
            return Err(InvocationError::from_status(
                status.as_u16(),
                format!("{} {} returned HTTP {}: {}", method, config.url, status.as_u16(), stringify(&data)),
            ));
        }

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
            "success": true
        }))
    }
}

// ---------------------------------------------------------------------------
// AI task
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiTaskConfig {
    prompt: String,
    api_key: String,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_ai_base_url")]
    base_url: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_ai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Chat completion against an OpenAI-compatible endpoint
struct AiTaskInvoker {
    client: reqwest::Client,
}

#[async_trait]
impl CapabilityInvoker for AiTaskInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let config: AiTaskConfig = request.typed()?;
        let mut messages = Vec::new();
        if let Some(system) = &config.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": config.prompt }));

        let mut body = json!({ "model": config.model, "messages": messages });
        if let Some(temperature) = config.temperature {
            body["temperature"] = json!(temperature);
        }

        let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| reqwest_error("AI request failed", e))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| reqwest_error("AI response was not JSON", e))?;
        if !status.is_success() {
            let message = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("AI provider rejected the request");
            return Err(InvocationError::from_status(status.as_u16(), message));
        }

        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| InvocationError::internal("AI response has no message content"))?;
        Ok(json!({
            "text": text,
            "model": payload.get("model").cloned().unwrap_or(json!(config.model)),
            "usage": payload.get("usage").cloned().unwrap_or(Value::Null)
        }))
    }
}

// ---------------------------------------------------------------------------
// Email through an HTTP relay
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailConfig {
    relay_url: String,
    to: Value,
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

struct SendEmailInvoker {
    client: reqwest::Client,
}

#[async_trait]
impl CapabilityInvoker for SendEmailInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let config: SendEmailConfig = request.typed()?;
        let recipients: Vec<String> = match &config.to {
            Value::Array(items) => items.iter().map(stringify).collect(),
            other => stringify(other)
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };
        if recipients.is_empty() {
            return Err(InvocationError::validation("sendEmail needs at least one recipient"));
        }

        let mut builder = self.client.post(&config.relay_url).json(&json!({
            "from": config.from,
            "to": recipients,
            "subject": config.subject,
            "body": config.body,
        }));
        if let Some(key) = &config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| reqwest_error("mail relay request failed", e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InvocationError::from_status(
                status.as_u16(),
                format!("mail relay returned HTTP {}: {}", status.as_u16(), detail),
            ));
        }

        tracing::info!("📧 Email sent to {} recipient(s)", recipients.len());
        Ok(json!({ "sent": true, "to": recipients, "subject": config.subject }))
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL query
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseQueryConfig {
    connection_string: String,
    query: String,
    #[serde(default)]
    params: Vec<Value>,
}

/// Runs one parameterised statement per invocation
struct DatabaseQueryInvoker;

type SqlParam = Box<dyn ToSql + Sync + Send>;

fn json_i64(value: &Value) -> Result<Option<i64>, InvocationError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| InvocationError::validation(format!("{} is not an integer", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| InvocationError::validation(format!("'{}' is not an integer", s))),
        other => Err(InvocationError::validation(format!("{} is not an integer", other))),
    }
}

fn json_f64(value: &Value) -> Result<Option<f64>, InvocationError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| InvocationError::validation(format!("'{}' is not a number", s))),
        other => Err(InvocationError::validation(format!("{} is not a number", other))),
    }
}

fn narrow<T: TryFrom<i64>>(value: Option<i64>) -> Result<Option<T>, InvocationError> {
    value
        .map(|v| T::try_from(v).map_err(|_| InvocationError::validation(format!("{} is out of range", v))))
        .transpose()
}

/// Convert a JSON parameter to the type the prepared statement expects
fn sql_param(ty: &Type, value: &Value) -> Result<SqlParam, InvocationError> {
    let param: SqlParam = match *ty {
        Type::BOOL => Box::new(match value {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            other => Some(matches!(stringify(other).as_str(), "true" | "1" | "yes")),
        }),
        Type::INT2 => Box::new(narrow::<i16>(json_i64(value)?)?),
        Type::INT4 => Box::new(narrow::<i32>(json_i64(value)?)?),
        Type::INT8 => Box::new(json_i64(value)?),
        Type::FLOAT4 => Box::new(json_f64(value)?.map(|f| f as f32)),
        Type::FLOAT8 => Box::new(json_f64(value)?),
        Type::JSON | Type::JSONB => Box::new((!value.is_null()).then(|| value.clone())),
        Type::UUID => Box::new(match value {
            Value::Null => None,
            other => Some(
                stringify(other)
                    .parse::<uuid::Uuid>()
                    .map_err(|e| InvocationError::validation(e.to_string()))?,
            ),
        }),
        Type::TIMESTAMPTZ => Box::new(match value {
            Value::Null => None,
            other => Some(
                DateTime::parse_from_rfc3339(&stringify(other))
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| InvocationError::validation(e.to_string()))?,
            ),
        }),
        _ => Box::new((!value.is_null()).then(|| stringify(value))),
    };
    Ok(param)
}

/// Read one column of a row as JSON
fn column_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> Value {
    fn get<'a, T>(row: &'a tokio_postgres::Row, index: usize) -> Option<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(index).ok().flatten()
    }

    match *ty {
        Type::BOOL => get::<bool>(row, index).map(Value::from),
        Type::INT2 => get::<i16>(row, index).map(Value::from),
        Type::INT4 => get::<i32>(row, index).map(Value::from),
        Type::INT8 => get::<i64>(row, index).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, index).map(Value::from),
        Type::FLOAT8 => get::<f64>(row, index).map(Value::from),
        Type::JSON | Type::JSONB => get::<Value>(row, index),
        Type::UUID => get::<uuid::Uuid>(row, index).map(|u| Value::String(u.to_string())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, index).map(|d| Value::String(d.to_rfc3339())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, index).map(|d| Value::String(d.to_string())),
        _ => get::<String>(row, index).map(Value::String),
    }
    .unwrap_or(Value::Null)
}

#[async_trait]
impl CapabilityInvoker for DatabaseQueryInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let config: DatabaseQueryConfig = request.typed()?;
        tracing::debug!("🐘 Executing databaseQuery node: {}", request.node_id);

        let (client, connection) =
            tokio_postgres::connect(&config.connection_string, tokio_postgres::NoTls)
                .await
                .map_err(|e| InvocationError::internal(format!("database connection failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("❌ PostgreSQL connection error: {}", e);
            }
        });

        let statement = client
            .prepare(&config.query)
            .await
            .map_err(|e| InvocationError::validation(format!("invalid query: {}", e)))?;
        if statement.params().len() != config.params.len() {
            return Err(InvocationError::validation(format!(
                "query expects {} parameter(s), {} given",
                statement.params().len(),
                config.params.len()
            )));
        }
        let params: Vec<SqlParam> = statement
            .params()
            .iter()
            .zip(&config.params)
            .map(|(ty, value)| sql_param(ty, value))
            .collect::<Result<_, _>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = client
            .query(&statement, &refs)
            .await
            .map_err(|e| InvocationError::internal(format!("query failed: {}", e)))?;

        let rows: Vec<Value> = rows
            .iter()
            .map(|row| {
                let object: Map<String, Value> = row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(i, column)| (column.name().to_string(), column_value(row, i, column.type_())))
                    .collect();
                Value::Object(object)
            })
            .collect();

        tracing::info!("✅ Query returned {} row(s)", rows.len());
        Ok(json!({ "rows": rows, "rowCount": rows.len() }))
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

struct LogMessageInvoker;

#[async_trait]
impl CapabilityInvoker for LogMessageInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let message = text_or_input(&request, "message")?;
        let level = request.str_or("level", "info");
        match level {
            "error" => tracing::error!(node_id = request.node_id, "📝 {}", message),
            "warn" | "warning" => tracing::warn!(node_id = request.node_id, "📝 {}", message),
            "debug" => tracing::debug!(node_id = request.node_id, "📝 {}", message),
            _ => tracing::info!(node_id = request.node_id, "📝 {}", message),
        }
        Ok(json!({ "message": message, "level": level }))
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

struct ParseJsonInvoker;

#[async_trait]
impl CapabilityInvoker for ParseJsonInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let source = match request.config.get("jsonString").or(Some(request.input)) {
            Some(Value::String(text)) => text.clone(),
            // Already structured: nothing to parse
            Some(other) if !other.is_null() => return Ok(other.clone()),
            _ => return Err(InvocationError::validation("parseJson needs 'jsonString' or a string input")),
        };
        serde_json::from_str(&source)
            .map_err(|e| InvocationError::validation(format!("invalid JSON: {}", e)))
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

/// Sleeps, then passes its input through
struct DelayInvoker;

#[async_trait]
impl CapabilityInvoker for DelayInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let raw = request
            .config
            .get("delayMs")
            .or_else(|| request.config.get("duration"))
            .cloned()
            .unwrap_or(json!(0));
        let millis = match &raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| InvocationError::validation(format!("invalid delay: {}", raw)))?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(request.input.clone()),
            _ = request.cancel.cancelled() => Err(InvocationError::internal("delay cancelled")),
        }
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

struct TextCaseInvoker {
    upper: bool,
}

#[async_trait]
impl CapabilityInvoker for TextCaseInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let text = text_or_input(&request, "text")?;
        Ok(Value::String(if self.upper {
            text.to_uppercase()
        } else {
            text.to_lowercase()
        }))
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

struct ConcatenateInvoker;

#[async_trait]
impl CapabilityInvoker for ConcatenateInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let parts = request
            .config
            .get("strings")
            .or_else(|| request.config.get("values"))
            .and_then(Value::as_array)
            .ok_or_else(|| InvocationError::validation("concatenateStrings needs a 'strings' array"))?;
        let separator = request.str_or("separator", "");
        let joined = parts.iter().map(stringify).collect::<Vec<_>>().join(separator);
        Ok(Value::String(joined))
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

struct SplitInvoker;

#[async_trait]
impl CapabilityInvoker for SplitInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let text = text_or_input(&request, "text")?;
        let delimiter = request.str_or("delimiter", ",");
        let parts: Vec<Value> = if delimiter.is_empty() {
            text.chars().map(|c| Value::String(c.to_string())).collect()
        } else {
            text.split(delimiter).map(|s| Value::String(s.to_string())).collect()
        };
        Ok(Value::Array(parts))
    }

    fn side_effecting(&self) -> bool {
        false
    }
}

struct FormatDateInvoker;

#[async_trait]
impl CapabilityInvoker for FormatDateInvoker {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<Value, InvocationError> {
        let format = request.str_or("format", "%Y-%m-%d");
        let date = match request.config.get("date").map(stringify) {
            None => Utc::now(),
            Some(raw) if raw.is_empty() || raw == "now" => Utc::now(),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|d| d.with_timezone(&Utc))
                .or_else(|_| {
                    chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                        .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
                })
                .map_err(|e| InvocationError::validation(format!("invalid date '{}': {}", raw, e)))?,
        };

        use std::fmt::Write;
        let mut formatted = String::new();
        write!(formatted, "{}", date.format(format))
            .map_err(|_| InvocationError::validation(format!("invalid date format '{}'", format)))?;
        Ok(Value::String(formatted))
    }

    fn side_effecting(&self) -> bool {
        false
    }
}
