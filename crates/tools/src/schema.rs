//! Tool parameter schemas.
//!
//! Parameters are an explicit typed tree rather than raw JSON-schema: the
//! wire shape the completion service expects is emitted from the tree, and
//! inbound tool-call arguments are validated (and normalized) against it.

use serde_json::{Map, Value, json};

/// The type of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object {
        properties: Vec<ParamSpec>,
        /// Open objects forward properties the schema does not declare;
        /// closed objects drop them.
        open: bool,
    },
    Array {
        /// Schema every element must match.  `None` = untyped array.
        items: Option<Box<ParamKind>>,
    },
}

impl ParamKind {
    fn type_name(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object { .. } => "object",
            ParamKind::Array { .. } => "array",
        }
    }
}

/// One declared parameter: name, prose for the model, and its type.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub description: String,
    pub required: bool,
    /// Substituted when an optional parameter is absent.
    pub default: Option<Value>,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, description: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            default: None,
            kind,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            default: None,
            kind,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

// ── JSON-schema emission ─────────────────────────────────────────────────────

/// Build the `input_schema` object for a tool's parameter list:
/// `{type: "object", properties: {...}, required: [...]}`.
pub fn input_schema(params: &[ParamSpec]) -> Value {
    object_schema(params, false)
}

fn object_schema(params: &[ParamSpec], open: bool) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for param in params {
        properties.insert(param.name.clone(), param_schema(param));
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }
    let mut schema = json!({
        "type": "object",
        "properties": properties,
        "required": required,
    });
    if open {
        schema["additionalProperties"] = json!(true);
    }
    schema
}

fn param_schema(param: &ParamSpec) -> Value {
    let mut schema = kind_schema(&param.kind);
    if !param.description.is_empty() {
        schema["description"] = json!(param.description);
    }
    if let Some(default) = &param.default {
        schema["default"] = default.clone();
    }
    schema
}

fn kind_schema(kind: &ParamKind) -> Value {
    match kind {
        ParamKind::Object { properties, open } => object_schema(properties, *open),
        ParamKind::Array { items } => {
            let mut schema = json!({"type": "array"});
            if let Some(items) = items {
                schema["items"] = kind_schema(items);
            }
            schema
        }
        other => json!({"type": other.type_name()}),
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Validate `args` against a parameter list and return the normalized
/// argument map: defaults filled in, undeclared properties dropped (unless
/// an object schema is open).  Errors name the offending field with a
/// dotted path (`filters.date_from`).
pub fn validate_args(params: &[ParamSpec], args: &Value) -> Result<Map<String, Value>, String> {
    let map = match args {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => return Err(format!("arguments must be an object, got {}", json_type(other))),
    };
    check_object(params, false, &map, "")
}

fn check_object(
    params: &[ParamSpec],
    open: bool,
    map: &Map<String, Value>,
    path: &str,
) -> Result<Map<String, Value>, String> {
    let mut normalized = Map::new();
    for param in params {
        let field_path = join_path(path, &param.name);
        match map.get(&param.name) {
            Some(value) => {
                normalized.insert(param.name.clone(), check_value(&param.kind, value, &field_path)?);
            }
            None if param.required => {
                return Err(format!("missing required field `{field_path}`"));
            }
            None => {
                if let Some(default) = &param.default {
                    normalized.insert(param.name.clone(), default.clone());
                }
            }
        }
    }
    if open {
        for (key, value) in map {
            normalized.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    Ok(normalized)
}

fn check_value(kind: &ParamKind, value: &Value, path: &str) -> Result<Value, String> {
    match kind {
        ParamKind::String => match value {
            Value::String(_) => Ok(value.clone()),
            other => Err(mismatch(path, "string", other)),
        },
        ParamKind::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            other => Err(mismatch(path, "integer", other)),
        },
        ParamKind::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            other => Err(mismatch(path, "number", other)),
        },
        ParamKind::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            other => Err(mismatch(path, "boolean", other)),
        },
        ParamKind::Object { properties, open } => match value {
            Value::Object(map) => Ok(Value::Object(check_object(properties, *open, map, path)?)),
            other => Err(mismatch(path, "object", other)),
        },
        ParamKind::Array { items } => match value {
            Value::Array(elements) => {
                let Some(items) = items else {
                    return Ok(value.clone());
                };
                let mut checked = Vec::with_capacity(elements.len());
                for (index, element) in elements.iter().enumerate() {
                    checked.push(check_value(items, element, &format!("{path}[{index}]"))?);
                }
                Ok(Value::Array(checked))
            }
            other => Err(mismatch(path, "array", other)),
        },
    }
}

fn mismatch(path: &str, expected: &str, got: &Value) -> String {
    format!("field `{path}` must be a {expected}, got {}", json_type(got))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}
