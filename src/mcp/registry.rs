//! Tool registry.
//!
//! Tools are registered on a [`ToolRegistryBuilder`] at startup. Building
//! freezes the set; the resulting [`ToolRegistry`] is read-only and shared
//! without locks.

use crate::error::{RegistryError, ToolError};
use crate::mcp::schema::{Arguments, ParameterSchema};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tool body. Returns the result value or a failure message.
pub type ToolHandler = Arc<dyn Fn(&Arguments) -> Result<Value, String> + Send + Sync>;

/// A named, schema-checked device action.
#[derive(Clone)]
pub struct ToolDescriptor {
    name: String,
    description: String,
    schema: ParameterSchema,
    handler: ToolHandler,
}

impl ToolDescriptor {
    pub fn new<F>(name: &str, description: &str, schema: ParameterSchema, handler: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            schema,
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Collects tools before the registry is frozen.
#[derive(Debug, Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistryBuilder {
    /// # Errors
    ///
    /// [`RegistryError::DuplicateTool`] when the name is taken and
    /// [`RegistryError::InvalidName`] for empty names or names with
    /// whitespace.
    pub fn register(&mut self, tool: ToolDescriptor) -> Result<(), RegistryError> {
        if tool.name.is_empty() || tool.name.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidName(tool.name));
        }
        if self.tools.contains_key(&tool.name) {
            return Err(RegistryError::DuplicateTool(tool.name));
        }
        debug!("registered tool {}", tool.name);
        self.tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    #[must_use]
    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Frozen name → tool map.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    #[must_use]
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted tool names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// `{name, description, inputSchema}` for every tool, sorted by name.
    #[must_use]
    pub fn tools_json(&self) -> Vec<Value> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.schema.to_json(),
                })
            })
            .collect()
    }

    /// Look up, validate and run one tool. Handler panics are caught and
    /// reported as [`ToolError::ExecutionFailed`].
    ///
    /// # Errors
    ///
    /// [`ToolError::NotFound`], [`ToolError::InvalidArguments`] or
    /// [`ToolError::ExecutionFailed`].
    pub fn handle_tool_call(&self, name: &str, arguments: &Value) -> Result<Value, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_owned(),
        })?;
        let args = tool
            .schema
            .validate(arguments)
            .map_err(|reason| ToolError::InvalidArguments {
                name: name.to_owned(),
                reason,
            })?;

        let handler = Arc::clone(&tool.handler);
        match catch_unwind(AssertUnwindSafe(|| handler(&args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ToolError::ExecutionFailed {
                name: name.to_owned(),
                message,
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("tool {name} panicked: {message}");
                Err(ToolError::ExecutionFailed {
                    name: name.to_owned(),
                    message: format!("handler panicked: {message}"),
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
