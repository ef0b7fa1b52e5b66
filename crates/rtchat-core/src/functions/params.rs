//! Parameter schemas and argument binding for callable functions.
//!
//! The service sends arguments as a JSON object string. [`bind`] checks it
//! against a function's schemas and produces typed [`Params`].

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::error::AppError;

/// Accepted shape of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Number,
    String,
    NumberArray,
    Object,
}

impl ParamKind {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::String => "string",
            Self::NumberArray => "array of numbers",
            Self::Object => "object",
        }
    }

    fn json_schema(self, description: &str) -> Value {
        match self {
            Self::Number => json!({"type": "number", "description": description}),
            Self::String => json!({"type": "string", "description": description}),
            Self::NumberArray => json!({
                "type": "array",
                "description": description,
                "items": {"type": "number"},
            }),
            Self::Object => json!({"type": "object", "description": description}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSchema {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSchema {
    pub fn required(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// `(properties, required)` halves of an object JSON Schema.
pub(crate) fn params_to_json_schema(params: &[ParamSchema]) -> (Value, Value) {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        properties.insert(param.name.clone(), param.kind.json_schema(&param.description));
        if param.required {
            required.push(json!(param.name));
        }
    }
    (Value::Object(properties), Value::Array(required))
}

/// A bound argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    String(String),
    NumberArray(Vec<f64>),
    Object(Map<String, Value>),
}

impl ParamValue {
    fn bind(schema: &ParamSchema, raw: &Value) -> Result<Self, AppError> {
        let invalid = || {
            AppError::warning(format!(
                "invalid parameter type: expected {}, got {}",
                schema.kind.type_name(),
                raw
            ))
        };
        match schema.kind {
            ParamKind::Number => number(raw).map(Self::Number).ok_or_else(invalid),
            ParamKind::String => match raw {
                Value::String(text) => Ok(Self::String(text.clone())),
                _ => Err(invalid()),
            },
            ParamKind::NumberArray => {
                let Value::Array(items) = raw else {
                    return Err(invalid());
                };
                items
                    .iter()
                    .map(|item| {
                        number(item)
                            .ok_or_else(|| AppError::warning(format!("invalid parameter: {item}")))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::NumberArray)
            }
            ParamKind::Object => match raw {
                Value::Object(map) => Ok(Self::Object(map.clone())),
                _ => Err(invalid()),
            },
        }
    }
}

/// Numbers, or strings that parse as one.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Arguments bound against a function's schemas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn numbers(&self, name: &str) -> Result<&[f64], AppError> {
        match self.get(name) {
            Some(ParamValue::NumberArray(values)) => Ok(values.as_slice()),
            Some(other) => Err(AppError::warning(format!(
                "invalid parameter type: expected array of numbers, got {other:?}"
            ))),
            None => Err(AppError::warning(format!("missing required parameter: {name}"))),
        }
    }
}

/// Bind raw arguments to `schemas`. Unknown keys are ignored; `null` counts
/// as absent.
pub fn bind(schemas: &[ParamSchema], arguments: &Value) -> Result<Params, AppError> {
    let empty = Map::new();
    let object = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(AppError::warning(format!(
                "invalid arguments: expected a JSON object, got {other}"
            )));
        }
    };

    let mut params = Params::default();
    for schema in schemas {
        match object.get(&schema.name) {
            None | Some(Value::Null) if schema.required => {
                return Err(AppError::warning(format!(
                    "missing required parameter: {}",
                    schema.name
                )));
            }
            None | Some(Value::Null) => {}
            Some(raw) => params.insert(schema.name.clone(), ParamValue::bind(schema, raw)?),
        }
    }
    Ok(params)
}
