use crate::message::{serialized_size, Message, MessageType, Payload, Priority};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Payloads above this serialized size draw a validation warning.
const MAX_PAYLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Score floor below which a message is rejected even without errors.
const MIN_VALID_SCORE: f64 = 0.7;

/// Error severity; each level carries a fixed score deduction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn deduction(self) -> f64 {
        match self {
            Self::Critical => 0.5,
            Self::High => 0.3,
            Self::Medium => 0.2,
            Self::Low => 0.1,
        }
    }
}

/// Deduction applied per warning. Warnings carry no severity.
const WARNING_DEDUCTION: f64 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Outcome of validating one message.
///
/// The score starts at 1.0 and is reduced by each error's severity
/// deduction and by 0.05 per warning, clamped to zero. Suggestions are
/// advisory and never affect the score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    pub score: f64,
}

impl ValidationResult {
    pub fn from_parts(
        errors: Vec<ValidationIssue>,
        warnings: Vec<String>,
        suggestions: Vec<String>,
    ) -> Self {
        let deduction: f64 = errors.iter().map(|issue| issue.severity.deduction()).sum::<f64>()
            + warnings.len() as f64 * WARNING_DEDUCTION;
        let score = (1.0 - deduction).max(0.0);
        Self {
            valid: errors.is_empty() && score >= MIN_VALID_SCORE,
            errors,
            warnings,
            suggestions,
            score,
        }
    }

    /// First error message, for surfacing a rejection reason.
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(|issue| issue.message.as_str())
    }
}

/// Findings from one type-specific validation rule.
#[derive(Debug, Default)]
pub struct RuleReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

/// Pluggable per-type validation rule.
pub type TypeRule = Box<dyn Fn(&Message) -> RuleReport + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TransformCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Default)]
struct TransformCache {
    map: HashMap<(String, String, String), Payload>,
    hits: u64,
    misses: u64,
}

/// Validation, scoring, and schema transformation of message payloads.
pub struct SchemaAdapter {
    rules: RwLock<HashMap<MessageType, Vec<TypeRule>>>,
    cache: Mutex<TransformCache>,
}

impl Default for SchemaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaAdapter {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            cache: Mutex::new(TransformCache::default()),
        }
    }

    /// Register a type-specific rule. Many rules may register per type;
    /// all run for every message of that type.
    pub fn register_rule(&self, kind: MessageType, rule: TypeRule) {
        self.rules.write().entry(kind).or_default().push(rule);
    }

    /// Structural, payload, context, and type-specific checks, in order.
    pub fn validate_message(&self, message: &Message) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut suggestions = Vec::new();

        // Structural.
        if message.id.trim().is_empty() {
            errors.push(ValidationIssue::new(
                "id",
                "message id is required",
                Severity::High,
            ));
        }
        if message.source == message.target {
            errors.push(ValidationIssue::new(
                "target",
                "source and target cannot be the same",
                Severity::Critical,
            ));
        }
        if let Some(raw) = message.raw_priority.as_deref() {
            if Priority::parse(raw).is_none() {
                warnings.push(format!(
                    "unknown priority `{raw}`; defaulting to normal"
                ));
            }
        }

        // Payload.
        if message.payload.data.is_null() {
            errors.push(ValidationIssue::new(
                "payload.data",
                "payload data is required",
                Severity::Critical,
            ));
        }
        match message.payload.metadata.as_ref() {
            None => errors.push(ValidationIssue::new(
                "payload.metadata",
                "payload metadata is missing",
                Severity::High,
            )),
            Some(metadata) => {
                if metadata.checksum != message.payload.recompute_checksum() {
                    errors.push(ValidationIssue::new(
                        "payload.metadata.checksum",
                        "checksum does not match payload data",
                        Severity::Medium,
                    ));
                }
                if metadata.size > MAX_PAYLOAD_BYTES {
                    warnings.push(format!(
                        "payload size {} exceeds {} bytes",
                        metadata.size, MAX_PAYLOAD_BYTES
                    ));
                }
            }
        }
        if message.payload.schema.is_none() {
            warnings.push("payload schema identifier is missing".to_string());
        }
        if message.payload.metadata.is_none()
            && serialized_size(&message.payload.data) > MAX_PAYLOAD_BYTES
        {
            warnings.push(format!(
                "payload size exceeds {MAX_PAYLOAD_BYTES} bytes"
            ));
        }

        // Context. A missing correlation id only warns on request/response
        // kinds; one-way events get a suggestion so a fully well-formed
        // event still scores 1.0.
        if message.context.session_id.is_none() {
            warnings.push("context.session_id is missing".to_string());
            suggestions.push("set context.session_id to group related traffic".to_string());
        }
        if message.context.correlation_id.is_none() {
            if message.kind.is_correlated() {
                warnings.push("context.correlation_id is missing".to_string());
            } else {
                suggestions
                    .push("set context.correlation_id to trace this message".to_string());
            }
        }

        // Type-specific rules.
        {
            let rules = self.rules.read();
            match rules.get(&message.kind) {
                Some(type_rules) if !type_rules.is_empty() => {
                    for rule in type_rules {
                        let report = rule(message);
                        errors.extend(report.errors);
                        warnings.extend(report.warnings);
                    }
                }
                _ => suggestions.push(format!(
                    "no validation rule registered for type `{}`",
                    message.kind
                )),
            }
        }

        ValidationResult::from_parts(errors, warnings, suggestions)
    }

    /// Schema-driven field-by-field transformation.
    ///
    /// Results are cached by `(source_schema, target_schema, checksum)`;
    /// repeated transformations of identical input are O(1) after the
    /// first and return bit-identical output.
    pub fn transform_payload(&self, payload: &Payload, target_schema: &str) -> Payload {
        let source_schema = payload.schema.clone().unwrap_or_default();
        let checksum = payload.recompute_checksum();
        let key = (
            source_schema.clone(),
            target_schema.to_string(),
            checksum,
        );

        {
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.map.get(&key).cloned() {
                cache.hits += 1;
                return cached;
            }
            cache.misses += 1;
        }

        let transformed = transform_value(&payload.data, &source_schema, target_schema);
        let result = Payload::new(transformed, target_schema);
        debug!(
            source_schema = %source_schema,
            target_schema = %target_schema,
            "transformed payload"
        );

        self.cache.lock().map.insert(key, result.clone());
        result
    }

    pub fn cache_stats(&self) -> TransformCacheStats {
        let cache = self.cache.lock();
        TransformCacheStats {
            hits: cache.hits,
            misses: cache.misses,
            entries: cache.map.len(),
        }
    }

    /// Release caches and rule registries (controller shutdown).
    pub fn clear(&self) {
        self.rules.write().clear();
        *self.cache.lock() = TransformCache::default();
    }
}

/// Compatibility name for a JSON value per the fixed type table:
/// string~text, number~float/integer, boolean~flag, object~structure,
/// array~list.
pub fn compat_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "flag",
        Value::Number(number) => {
            if number.is_f64() {
                "float"
            } else {
                "integer"
            }
        }
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "structure",
    }
}

/// Total, deterministic field-by-field mapping into the target schema's
/// naming: every field keeps its name and value and is annotated with its
/// compatibility type. Non-object payloads are wrapped under `value`.
fn transform_value(data: &Value, source_schema: &str, target_schema: &str) -> Value {
    let fields: Map<String, Value> = match data {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };

    let mut mapped = Map::new();
    for (name, value) in fields {
        mapped.insert(
            name,
            json!({
                "type": compat_type_name(&value),
                "value": value,
            }),
        );
    }

    json!({
        "schema": target_schema,
        "source_schema": source_schema,
        "fields": Value::Object(mapped),
    })
}

/// Stable 64-bit hash of an identity string (first 8 bytes of SHA-256).
fn stable_hash(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

fn identity_of(data: &Value) -> &str {
    data.get("name")
        .or_else(|| data.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("unnamed")
}

/// Map a reasoning-template object to a field object.
///
/// All derived attributes are pure functions of the input:
/// - `frequency`: 0.1..10.0 Hz from a stable hash of the template identity
/// - `phase`: 0..2π from the same hash
/// - `coherence`: 0.5 + complexity * 0.05, clamped to [0, 1]
/// - `amplitude`: 1 / (1 + depth)
/// - `dimension`: depth + 1
pub fn adapt_reasoning_to_dynamics(data: &Value) -> Value {
    let data = normalize_object(data);
    let name = identity_of(&data).to_string();
    let complexity = data.get("complexity").and_then(Value::as_f64).unwrap_or(1.0);
    let depth = data.get("depth").and_then(Value::as_u64).unwrap_or(1);

    let hash = stable_hash(&name);
    let frequency = 0.1 + (hash % 10_000) as f64 / 10_000.0 * 9.9;
    let phase = ((hash >> 16) % 62_832) as f64 / 10_000.0;
    let coherence = (0.5 + complexity * 0.05).clamp(0.0, 1.0);
    let amplitude = 1.0 / (1.0 + depth as f64);

    json!({
        "name": name,
        "frequency": frequency,
        "phase": phase,
        "coherence": coherence,
        "amplitude": amplitude,
        "dimension": depth + 1,
        "source_template": data,
    })
}

/// Map a field object back to a reasoning-template object, inverting the
/// derivations in `adapt_reasoning_to_dynamics` where they are invertible:
/// complexity from coherence, depth from amplitude.
pub fn adapt_dynamics_to_reasoning(data: &Value) -> Value {
    let data = normalize_object(data);
    let name = identity_of(&data).to_string();
    let coherence = data.get("coherence").and_then(Value::as_f64).unwrap_or(0.5);
    let amplitude = data
        .get("amplitude")
        .and_then(Value::as_f64)
        .filter(|a| *a > 0.0)
        .unwrap_or(0.5);

    let complexity = ((coherence - 0.5) / 0.05).round().max(0.0);
    let depth = (1.0 / amplitude - 1.0).round().max(0.0) as u64;

    json!({
        "name": name,
        "complexity": complexity,
        "depth": depth,
        "tags": ["derived"],
        "source_field": data,
    })
}

/// Any non-object value is wrapped so the mappings stay total.
fn normalize_object(data: &Value) -> Value {
    if data.is_object() {
        data.clone()
    } else {
        json!({ "value": data })
    }
}
