//! Typed parameter schemas for device tools.

use serde_json::{Map, Value, json};

/// Type of one tool parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Boolean,
    /// Inclusive bounds.
    Integer { min: Option<i64>, max: Option<i64> },
    String,
}

impl PropertyKind {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer { .. } => "integer",
            Self::String => "string",
        }
    }
}

/// One named parameter. Required unless it has a default.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub kind: PropertyKind,
    pub description: Option<String>,
    pub default: Option<Value>,
}

/// Ordered list of parameters a tool accepts.
///
/// Built with chained calls; [`ParameterSchema::with_default`] and
/// [`ParameterSchema::describe`] apply to the most recently added property.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    properties: Vec<Property>,
}

impl ParameterSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn boolean(self, name: &str) -> Self {
        self.push(name, PropertyKind::Boolean)
    }

    #[must_use]
    pub fn integer(self, name: &str, min: i64, max: i64) -> Self {
        self.push(
            name,
            PropertyKind::Integer {
                min: Some(min),
                max: Some(max),
            },
        )
    }

    #[must_use]
    pub fn string(self, name: &str) -> Self {
        self.push(name, PropertyKind::String)
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        if let Some(last) = self.properties.last_mut() {
            last.default = Some(value.into());
        }
        self
    }

    #[must_use]
    pub fn describe(mut self, description: &str) -> Self {
        if let Some(last) = self.properties.last_mut() {
            last.description = Some(description.to_owned());
        }
        self
    }

    fn push(mut self, name: &str, kind: PropertyKind) -> Self {
        self.properties.push(Property {
            name: name.to_owned(),
            kind,
            description: None,
            default: None,
        });
        self
    }

    #[must_use]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// JSON Schema object advertised in `tools/list`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.properties {
            let mut entry = Map::new();
            entry.insert("type".into(), json!(p.kind.type_name()));
            if let PropertyKind::Integer { min, max } = &p.kind {
                if let Some(min) = min {
                    entry.insert("minimum".into(), json!(min));
                }
                if let Some(max) = max {
                    entry.insert("maximum".into(), json!(max));
                }
            }
            if let Some(description) = &p.description {
                entry.insert("description".into(), json!(description));
            }
            match &p.default {
                Some(default) => {
                    entry.insert("default".into(), default.clone());
                }
                None => required.push(json!(p.name)),
            }
            properties.insert(p.name.clone(), Value::Object(entry));
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `args` against the schema and fill in defaults.
    ///
    /// `null` counts as an empty object. Keys the schema does not declare
    /// are ignored and not passed on.
    ///
    /// # Errors
    ///
    /// A human-readable reason when `args` is not an object, a required
    /// parameter is missing, or a value has the wrong type or range.
    pub fn validate(&self, args: &Value) -> Result<Arguments, String> {
        let empty = Map::new();
        let given = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(format!("arguments must be an object, got {other}")),
        };

        let mut out = Map::new();
        for p in &self.properties {
            let value = match given.get(&p.name).or(p.default.as_ref()) {
                Some(value) => value,
                None => return Err(format!("missing required argument {:?}", p.name)),
            };
            check(p, value)?;
            out.insert(p.name.clone(), value.clone());
        }
        Ok(Arguments(out))
    }
}

fn check(p: &Property, value: &Value) -> Result<(), String> {
    let mismatch = || {
        format!(
            "argument {:?} must be {}, got {value}",
            p.name,
            p.kind.type_name()
        )
    };
    match &p.kind {
        PropertyKind::Boolean => value.as_bool().map(|_| ()).ok_or_else(mismatch),
        PropertyKind::String => value.as_str().map(|_| ()).ok_or_else(mismatch),
        PropertyKind::Integer { min, max } => {
            let n = value.as_i64().ok_or_else(mismatch)?;
            if min.is_some_and(|min| n < min) || max.is_some_and(|max| n > max) {
                return Err(format!(
                    "argument {:?} = {n} out of range {}..={}",
                    p.name,
                    min.map_or_else(|| "-inf".to_owned(), |v| v.to_string()),
                    max.map_or_else(|| "inf".to_owned(), |v| v.to_string()),
                ));
            }
            Ok(())
        }
    }
}

/// Validated arguments handed to a tool handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(Map<String, Value>);

impl Arguments {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }
}
