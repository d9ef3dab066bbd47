//! JSON payload cleaning and per-endpoint field rules.
//!
//! Incoming JSON bodies are first stripped of `null` and empty-string values
//! (recursively, in objects and arrays), then the rules registered for the
//! request's exact path and method are applied to the fields that remain.
//! Rules may rewrite a value (truncate, trim, coerce to boolean) or reject the
//! payload with a [`ValidationError`].

use axum::http::Method;
use serde_json::{Map, Value};
use thiserror::Error;

// =============================================================================
// Validation Errors
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid email format: {0}")]
    InvalidEmail(String),

    #[error("Expected boolean, got {0}")]
    ExpectedBoolean(&'static str),

    #[error("Field '{field}' must be of type {expected}, got {actual}")]
    WrongType {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Field '{field}' must be at least {min} characters")]
    TooShort { field: String, min: usize },

    #[error("Field '{field}' must be one of: {allowed}")]
    NotAllowed { field: String, allowed: String },

    #[error("Field '{field}' cannot have more than {max} items")]
    TooManyItems { field: String, max: usize },
}

// =============================================================================
// Field Rules
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Email,
    Boolean,
    List,
}

/// Constraints for one field of a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRule {
    pub required: bool,
    pub field_type: Option<FieldType>,
    pub max_length: Option<usize>,
    pub min_length: Option<usize>,
    pub strip: bool,
    pub allowed: Vec<String>,
    pub max_items: Option<usize>,
}

impl FieldRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn of_type(mut self, field_type: FieldType) -> Self {
        self.field_type = Some(field_type);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn strip(mut self) -> Self {
        self.strip = true;
        self
    }

    pub fn allowed(mut self, values: &[&str]) -> Self {
        self.allowed = values.iter().map(|v| (*v).to_string()).collect();
        self
    }

    pub fn max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }
}

/// Field rules for one exact path and method.
#[derive(Debug, Clone)]
pub struct EndpointRules {
    pub path: String,
    pub method: Method,
    pub fields: Vec<(String, FieldRule)>,
}

/// All registered endpoint rules.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    endpoints: Vec<EndpointRules>,
}

impl ValidationRules {
    pub fn new(endpoints: Vec<EndpointRules>) -> Self {
        Self { endpoints }
    }

    /// Rules for an exact path and method; empty when none are registered.
    pub fn for_endpoint(&self, path: &str, method: &Method) -> &[(String, FieldRule)] {
        self.endpoints
            .iter()
            .find(|e| e.path == path && e.method == *method)
            .map(|e| e.fields.as_slice())
            .unwrap_or(&[])
    }
}

fn endpoint(path: &str, method: Method, fields: Vec<(&str, FieldRule)>) -> EndpointRules {
    EndpointRules {
        path: path.to_string(),
        method,
        fields: fields
            .into_iter()
            .map(|(name, rule)| (name.to_string(), rule))
            .collect(),
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::new(vec![
            endpoint(
                "/api/messages/",
                Method::POST,
                vec![
                    ("message_body", FieldRule::new().max_length(1000).strip()),
                    (
                        "conversation",
                        FieldRule::new().required().of_type(FieldType::String),
                    ),
                    (
                        "message_type",
                        FieldRule::new().allowed(&["text", "image", "file"]),
                    ),
                ],
            ),
            endpoint(
                "/api/conversations/",
                Method::POST,
                vec![
                    (
                        "participant_emails",
                        FieldRule::new().of_type(FieldType::List).max_items(10),
                    ),
                    ("group_name", FieldRule::new().max_length(100).strip()),
                    ("is_group", FieldRule::new().of_type(FieldType::Boolean)),
                ],
            ),
            endpoint(
                "/api/auth/register/",
                Method::POST,
                vec![
                    (
                        "email",
                        FieldRule::new().required().of_type(FieldType::Email),
                    ),
                    ("password", FieldRule::new().required().min_length(8)),
                    ("first_name", FieldRule::new().max_length(50).strip()),
                    ("last_name", FieldRule::new().max_length(50).strip()),
                ],
            ),
        ])
    }
}

// =============================================================================
// Cleaning and Rule Application
// =============================================================================

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursively drop `null` and `""` from objects and arrays.
pub fn remove_empty_values(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !is_empty_value(v))
                .map(|(k, v)| (k, remove_empty_values(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !is_empty_value(v))
                .map(remove_empty_values)
                .collect(),
        ),
        other => other,
    }
}

/// Apply a single rule to a present field value.
pub fn apply_field_rule(field: &str, value: Value, rule: &FieldRule) -> Result<Value, ValidationError> {
    let mut value = match (rule.field_type, value) {
        (Some(FieldType::Email), Value::String(s)) => {
            if !s.contains('@') {
                return Err(ValidationError::InvalidEmail(s));
            }
            Value::String(s)
        }
        (Some(FieldType::Boolean), Value::Bool(b)) => Value::Bool(b),
        (Some(FieldType::Boolean), Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(ValidationError::ExpectedBoolean("string")),
        },
        (Some(FieldType::Boolean), other) => {
            return Err(ValidationError::ExpectedBoolean(json_type_name(&other)));
        }
        (Some(FieldType::String | FieldType::Email), other @ Value::String(_)) => other,
        (Some(FieldType::List), other @ Value::Array(_)) => other,
        (Some(expected), other) => {
            return Err(ValidationError::WrongType {
                field: field.to_string(),
                expected: match expected {
                    FieldType::List => "array",
                    _ => "string",
                },
                actual: json_type_name(&other),
            });
        }
        (None, other) => other,
    };

    if let Value::String(s) = &mut value {
        if let Some(max) = rule.max_length
            && s.chars().count() > max
        {
            *s = s.chars().take(max).collect();
        }

        if rule.strip {
            let trimmed = s.trim();
            if trimmed.len() != s.len() {
                *s = trimmed.to_string();
            }
        }

        if let Some(min) = rule.min_length
            && s.chars().count() < min
        {
            return Err(ValidationError::TooShort {
                field: field.to_string(),
                min,
            });
        }

        if !rule.allowed.is_empty() && !rule.allowed.iter().any(|a| a == s) {
            return Err(ValidationError::NotAllowed {
                field: field.to_string(),
                allowed: rule.allowed.join(", "),
            });
        }
    }

    if let Value::Array(items) = &value
        && let Some(max) = rule.max_items
        && items.len() > max
    {
        return Err(ValidationError::TooManyItems {
            field: field.to_string(),
            max,
        });
    }

    Ok(value)
}

/// Clean a payload and apply endpoint rules to it.
///
/// Rules only address fields of a top-level object; for any other payload
/// shape, required fields are reported missing and other rules are skipped.
pub fn clean_and_validate(
    payload: Value,
    rules: &[(String, FieldRule)],
) -> Result<Value, ValidationError> {
    let cleaned = remove_empty_values(payload);

    let mut object = match cleaned {
        Value::Object(map) => map,
        other => {
            if let Some((field, _)) = rules.iter().find(|(_, rule)| rule.required) {
                return Err(ValidationError::MissingField(field.clone()));
            }
            return Ok(other);
        }
    };

    for (field, rule) in rules {
        match object.get_mut(field) {
            Some(slot) => {
                let value = std::mem::take(slot);
                *slot = apply_field_rule(field, value, rule)?;
            }
            None if rule.required => return Err(ValidationError::MissingField(field.clone())),
            None => {}
        }
    }

    Ok(Value::Object(object))
}
