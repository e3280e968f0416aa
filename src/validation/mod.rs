//! Payload validation.
//!
//! `JsonSchemaValidator` normalizes the payload before checking it, so that
//! transport quirks do not fail validation:
//!
//! - missing properties with a `default` are filled in
//! - scalars are coerced to the declared `type` (query strings arrive as text)
//! - properties not declared under `properties` are removed
//!
//! The normalized payload replaces the original on success.

use serde_json::{json, Map, Number, Value};

use crate::error::RequestError;

/// Checks, and possibly rewrites, a payload.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, payload: Value) -> Result<Value, RequestError>;
}

impl<F> SchemaValidator for F
where
    F: Fn(Value) -> Result<Value, RequestError> + Send + Sync,
{
    fn validate(&self, payload: Value) -> Result<Value, RequestError> {
        (self)(payload)
    }
}

pub struct JsonSchemaValidator {
    schema: Value,
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl JsonSchemaValidator {
    /// Compile `schema`. Fails when the schema itself is invalid.
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        Ok(Self {
            schema: schema.clone(),
            validator,
        })
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, payload: Value) -> Result<Value, RequestError> {
        let payload = normalize(&self.schema, payload);

        let errors: Vec<Value> = self
            .validator
            .iter_errors(&payload)
            .map(|error| {
                json!({
                    "path": error.instance_path.to_string(),
                    "message": error.to_string(),
                })
            })
            .collect();

        if errors.is_empty() {
            Ok(payload)
        } else {
            tracing::debug!(errors = errors.len(), "Payload failed validation");
            Err(RequestError::bad_request("Invalid payload").with_metadata(json!({ "errors": errors })))
        }
    }
}

/// Apply defaults, coercion and removal of undeclared properties.
pub fn normalize(schema: &Value, value: Value) -> Value {
    let Some(schema) = schema.as_object() else {
        return value;
    };

    let value = match schema.get("type").and_then(Value::as_str) {
        Some(declared) => coerce(declared, value),
        None => value,
    };

    match value {
        Value::Object(object) => Value::Object(normalize_object(schema, object)),
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) => Value::Array(
                items
                    .into_iter()
                    .map(|item| normalize(item_schema, item))
                    .collect(),
            ),
            None => Value::Array(items),
        },
        other => other,
    }
}

fn normalize_object(schema: &Map<String, Value>, mut object: Map<String, Value>) -> Map<String, Value> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return object;
    };

    object.retain(|key, _| properties.contains_key(key));

    for (name, property_schema) in properties {
        match object.remove(name) {
            Some(present) => {
                object.insert(name.clone(), normalize(property_schema, present));
            }
            None => {
                if let Some(default) = property_schema.get("default") {
                    object.insert(name.clone(), default.clone());
                }
            }
        }
    }
    object
}

fn coerce(declared: &str, value: Value) -> Value {
    match (declared, value) {
        ("integer", Value::String(raw)) => match raw.trim().parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => Value::String(raw),
        },
        ("number", Value::String(raw)) => match raw.trim().parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(raw),
        },
        ("boolean", Value::String(raw)) => match raw.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw),
        },
        ("string", Value::Number(n)) => Value::String(n.to_string()),
        ("string", Value::Bool(b)) => Value::String(b.to_string()),
        (_, other) => other,
    }
}
