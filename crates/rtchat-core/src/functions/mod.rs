//! Functions the realtime service may call.
//!
//! Every [`Callable`] describes itself with a [`ToolDescriptor`]; the
//! [`FunctionRegistry`] advertises those descriptors in the session
//! configuration and executes calls by name.

mod math;
mod params;

pub use math::Multiply;
pub use params::{ParamKind, ParamSchema, ParamValue, Params, bind};

use std::fmt;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::AppError;

/// Value returned to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutput {
    pub result: ResultValue,
    pub operation: String,
    pub inputs: Vec<f64>,
}

/// Name, description and parameters of a callable.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSchema>,
}

impl ToolDescriptor {
    /// Realtime session tool entry.
    ///
    /// ```json
    /// { "type": "function", "name", "description",
    ///   "parameters": { "type": "object", "properties", "required" } }
    /// ```
    pub fn to_tool_json(&self) -> Value {
        let (properties, required) = params::params_to_json_schema(&self.params);
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

pub trait Callable: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    fn call(&self, params: &Params) -> Result<FunctionOutput, AppError>;
}

struct Entry {
    descriptor: ToolDescriptor,
    callable: Box<dyn Callable>,
}

/// Callables keyed by name, kept in registration order.
#[derive(Default)]
pub struct FunctionRegistry {
    entries: Vec<Entry>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in functions. Failures are logged
    /// and the offending function is left out.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let builtins: Vec<Box<dyn Callable>> = vec![Box::new(Multiply)];
        for callable in builtins {
            if let Err(err) = registry.register(callable) {
                warn!("failed to load custom functions: {}", err.render());
            }
        }
        registry
    }

    pub fn register(&mut self, callable: Box<dyn Callable>) -> Result<(), AppError> {
        let descriptor = callable.descriptor();
        if descriptor.name.trim().is_empty() {
            return Err(AppError::warning("function name cannot be empty"));
        }
        if self.find(&descriptor.name).is_some() {
            return Err(AppError::warning(format!(
                "function already exists: {}",
                descriptor.name
            )));
        }
        debug!(function = %descriptor.name, "Registered function");
        self.entries.push(Entry {
            descriptor,
            callable,
        });
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.descriptor.name == name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.entries.iter().map(|entry| &entry.descriptor)
    }

    pub fn tools_json(&self) -> Vec<Value> {
        self.descriptors().map(ToolDescriptor::to_tool_json).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.descriptors().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode `arguments` (a JSON object string), bind them and run the
    /// named function.
    pub fn execute(&self, name: &str, arguments: &str) -> Result<FunctionOutput, AppError> {
        let entry = self
            .find(name)
            .ok_or_else(|| AppError::warning(format!("function doesn't exist: {name}")))?;
        let raw: Value = if arguments.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(arguments).map_err(AppError::unmarshal)?
        };
        let params = bind(&entry.descriptor.params, &raw)?;
        debug!(function = name, ?params, "Executing function");
        entry.callable.call(&params)
    }
}
