//! 负载模式校验 / Payload schema validation
//!
//! A [`Schema`] validates an untyped JSON payload and produces the typed value
//! installed on the envelope. Three flavours ship with the crate:
//!
//! * [`Typed`] deserializes into any `serde` type;
//! * [`ObjectSchema`] is a declarative field map with string-to-scalar coercion;
//! * [`FnSchema`] wraps a closure.
//!
//! [`SchemaRegistry`] assembles per-domain object schemas once at startup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::error::{BusError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// JSON path of the offending value, `$` being the payload root.
    pub path: String,
    pub message: String,
}

/// 校验失败，包含所有问题 / Validation failure listing every issue found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub issues: Vec<Issue>,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError { issues: vec![Issue { path: path.into(), message: message.into() }] }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.issues.iter().map(|i| format!("{}: {}", i.path, i.message)).collect();
        f.write_str(&parts.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// 模式：校验并强制转换负载
///
/// Validates (and possibly coerces) a payload into `Output`.
pub trait Schema: Send + Sync + 'static {
    type Output: Send + 'static;

    fn validate(&self, value: &Value) -> std::result::Result<Self::Output, ValidationError>;
}

/// Deserialize the payload into `T`.
pub struct Typed<T> {
    _marker: PhantomData<fn() -> T>,
}

pub fn typed<T: DeserializeOwned + Send + 'static>() -> Typed<T> {
    Typed { _marker: PhantomData }
}

impl<T: DeserializeOwned + Send + 'static> Schema for Typed<T> {
    type Output = T;

    fn validate(&self, value: &Value) -> std::result::Result<T, ValidationError> {
        T::deserialize(value).map_err(|e| ValidationError::new("$", e.to_string()))
    }
}

pub struct FnSchema<F, O> {
    check: F,
    _marker: PhantomData<fn() -> O>,
}

pub fn from_fn<F, O>(check: F) -> FnSchema<F, O>
where
    F: Fn(&Value) -> std::result::Result<O, ValidationError> + Send + Sync + 'static,
    O: Send + 'static,
{
    FnSchema { check, _marker: PhantomData }
}

impl<F, O> Schema for FnSchema<F, O>
where
    F: Fn(&Value) -> std::result::Result<O, ValidationError> + Send + Sync + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn validate(&self, value: &Value) -> std::result::Result<O, ValidationError> {
        (self.check)(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownKeys {
    #[default]
    Allow,
    Strip,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    String,
    /// Any JSON number; numeric strings are coerced.
    Number,
    /// Whole numbers only; integer strings are coerced.
    Integer,
    /// `true`/`false`, also as strings.
    Boolean,
    Object(ObjectSchema),
    Array { items: Box<FieldKind> },
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default = "required_by_default")]
    pub required: bool,
}

fn required_by_default() -> bool {
    true
}

/// 声明式对象模式 / Declarative object schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub unknown: UnknownKeys,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.set_field(FieldSpec { name: name.to_string(), kind, required: true });
        self
    }

    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.set_field(FieldSpec { name: name.to_string(), kind, required: false });
        self
    }

    pub fn unknown_keys(mut self, policy: UnknownKeys) -> Self {
        self.unknown = policy;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Insert a field, replacing an existing one of the same name in place.
    fn set_field(&mut self, spec: FieldSpec) {
        match self.fields.iter_mut().find(|f| f.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.fields.push(spec),
        }
    }

    fn check(&self, value: &Value, path: &str, issues: &mut Vec<Issue>) -> Option<Value> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                issues.push(Issue { path: path.to_string(), message: format!("expected object, got {}", type_name(other)) });
                return None;
            }
        };

        let before = issues.len();
        let mut output = Map::new();
        for spec in &self.fields {
            let field_path = format!("{}.{}", path, spec.name);
            match object.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    issues.push(Issue { path: field_path, message: "is required".to_string() });
                }
                None => {}
                Some(Value::Null) => {
                    output.insert(spec.name.clone(), Value::Null);
                }
                Some(raw) => {
                    if let Some(coerced) = spec.kind.coerce(raw, &field_path, issues) {
                        output.insert(spec.name.clone(), coerced);
                    }
                }
            }
        }

        for (key, raw) in object {
            if self.field(key).is_some() {
                continue;
            }
            match self.unknown {
                UnknownKeys::Allow => {
                    output.insert(key.clone(), raw.clone());
                }
                UnknownKeys::Strip => {}
                UnknownKeys::Deny => {
                    issues.push(Issue { path: format!("{}.{}", path, key), message: "is not allowed".to_string() });
                }
            }
        }

        if issues.len() > before {
            None
        } else {
            Some(Value::Object(output))
        }
    }
}

impl Schema for ObjectSchema {
    type Output = Value;

    fn validate(&self, value: &Value) -> std::result::Result<Value, ValidationError> {
        let mut issues = Vec::new();
        match self.check(value, "$", &mut issues) {
            Some(coerced) if issues.is_empty() => Ok(coerced),
            _ => Err(ValidationError { issues }),
        }
    }
}

impl FieldKind {
    fn coerce(&self, value: &Value, path: &str, issues: &mut Vec<Issue>) -> Option<Value> {
        let coerced = match (self, value) {
            (FieldKind::Any, v) => Some(v.clone()),
            (FieldKind::String, Value::String(_)) => Some(value.clone()),
            (FieldKind::Number, Value::Number(_)) => Some(value.clone()),
            (FieldKind::Number, Value::String(s)) => parse_number(s),
            (FieldKind::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Some(value.clone()),
            (FieldKind::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (FieldKind::Boolean, Value::Bool(_)) => Some(value.clone()),
            (FieldKind::Boolean, Value::String(s)) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (FieldKind::Object(schema), v) => return schema.check(v, path, issues),
            (FieldKind::Array { items }, Value::Array(values)) => {
                let before = issues.len();
                let coerced: Vec<Value> = values
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| items.coerce(v, &format!("{}[{}]", path, i), issues))
                    .collect();
                return if issues.len() > before { None } else { Some(Value::Array(coerced)) };
            }
            _ => None,
        };

        if coerced.is_none() {
            issues.push(Issue { path: path.to_string(), message: format!("expected {}, got {}", self.name(), describe(value)) });
        }
        coerced
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Object(_) => "object",
            FieldKind::Array { .. } => "array",
            FieldKind::Any => "any",
        }
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("string {:?}", s),
        other => type_name(other).to_string(),
    }
}

/// 启动时声明的模式配置 / Schema configuration declared at startup.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Fields merged into every domain.
    #[serde(default)]
    pub shared: Vec<FieldSpec>,
    #[serde(default)]
    pub domains: Vec<DomainSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// 从合并结果中移除的字段 / Fields removed from the merged map.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub unknown: UnknownKeys,
}

/// 按领域名索引的对象模式 / Object schemas by domain name.
///
/// 合并与排除只在构建时执行一次。
/// Merging and exclusion run once, when the registry is built.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, ObjectSchema>,
}

impl SchemaRegistry {
    pub fn build(config: SchemaConfig) -> Result<Self> {
        let mut schemas = HashMap::with_capacity(config.domains.len());
        for domain in config.domains {
            if schemas.contains_key(&domain.name) {
                return Err(BusError::Config(format!("schema domain '{}' declared twice", domain.name)));
            }

            let mut schema = ObjectSchema { fields: Vec::new(), unknown: domain.unknown };
            for spec in config.shared.iter().cloned().chain(domain.fields) {
                schema.set_field(spec);
            }

            let excluded: HashSet<&str> = domain.exclude.iter().map(String::as_str).collect();
            for name in &excluded {
                if schema.field(name).is_none() {
                    return Err(BusError::Config(format!(
                        "schema domain '{}' excludes unknown field '{}'",
                        domain.name, name
                    )));
                }
            }
            schema.fields.retain(|f| !excluded.contains(f.name.as_str()));

            debug!(
                "注册模式 {}: {} 个字段 / Registered schema {}: {} fields",
                domain.name,
                schema.fields.len(),
                domain.name,
                schema.fields.len()
            );
            schemas.insert(domain.name, schema);
        }
        Ok(SchemaRegistry { schemas })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SchemaConfig =
            serde_json::from_str(json).map_err(|e| BusError::Config(format!("invalid schema config: {}", e)))?;
        Self::build(config)
    }

    pub fn get(&self, domain: &str) -> Option<&ObjectSchema> {
        self.schemas.get(domain)
    }

    /// Owned copy for handing to a pipeline stage.
    pub fn schema(&self, domain: &str) -> Result<ObjectSchema> {
        self.get(domain)
            .cloned()
            .ok_or_else(|| BusError::Config(format!("no schema registered for '{}'", domain)))
    }

    pub fn domains(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_schema() -> ObjectSchema {
        ObjectSchema::new()
            .required("id", FieldKind::Number)
            .optional("note", FieldKind::String)
            .optional("express", FieldKind::Boolean)
    }

    #[test]
    fn valid_payload_passes_unchanged() {
        let payload = json!({"id": 1, "note": "leave at door"});
        assert_eq!(order_schema().validate(&payload).unwrap(), payload);
    }

    #[test]
    fn numeric_and_boolean_strings_are_coerced() {
        let out = order_schema().validate(&json!({"id": "42", "express": "true"})).unwrap();
        assert_eq!(out, json!({"id": 42, "express": true}));

        let out = order_schema().validate(&json!({"id": " 2.5 "})).unwrap();
        assert_eq!(out, json!({"id": 2.5}));
    }

    #[test]
    fn non_numeric_string_is_rejected() {
        let err = order_schema().validate(&json!({"id": "x"})).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].path, "$.id");
        assert_eq!(err.to_string(), "$.id: expected number, got string \"x\"");
    }

    #[test]
    fn missing_required_and_denied_keys_are_all_reported() {
        let schema = order_schema().unknown_keys(UnknownKeys::Deny);
        let err = schema.validate(&json!({"extra": 1, "id": null})).unwrap_err();
        let paths: Vec<&str> = err.issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["$.id", "$.extra"]);
    }

    #[test]
    fn strip_drops_unknown_keys() {
        let schema = order_schema().unknown_keys(UnknownKeys::Strip);
        let out = schema.validate(&json!({"id": 7, "debug": true})).unwrap();
        assert_eq!(out, json!({"id": 7}));
    }

    #[test]
    fn nested_objects_and_arrays() {
        let line = ObjectSchema::new().required("sku", FieldKind::String).required("qty", FieldKind::Integer);
        let schema = ObjectSchema::new()
            .required("id", FieldKind::Integer)
            .required("lines", FieldKind::Array { items: Box::new(FieldKind::Object(line)) });

        let out = schema.validate(&json!({"id": 1, "lines": [{"sku": "A", "qty": "3"}]})).unwrap();
        assert_eq!(out, json!({"id": 1, "lines": [{"sku": "A", "qty": 3}]}));

        let err = schema.validate(&json!({"id": 1.5, "lines": [{"sku": "A"}, 4]})).unwrap_err();
        let paths: Vec<&str> = err.issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["$.id", "$.lines[0].qty", "$.lines[1]"]);
    }

    #[test]
    fn non_object_root_is_rejected() {
        let err = order_schema().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(err.issues[0].path, "$");
    }

    #[test]
    fn typed_schema_uses_serde() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Order {
            id: u64,
        }
        assert_eq!(typed::<Order>().validate(&json!({"id": 3})).unwrap(), Order { id: 3 });
        assert!(typed::<Order>().validate(&json!({"id": "x"})).is_err());
    }

    #[test]
    fn closure_schema() {
        let positive = from_fn(|v: &Value| {
            v.as_i64().filter(|n| *n > 0).ok_or_else(|| ValidationError::new("$", "expected positive integer"))
        });
        assert_eq!(positive.validate(&json!(5)).unwrap(), 5);
        assert!(positive.validate(&json!(-1)).is_err());
    }

    #[test]
    fn registry_merges_shared_fields_and_applies_exclusions_once() {
        let registry = SchemaRegistry::from_json(
            r#"{
                "shared": [
                    {"name": "id", "kind": {"type": "integer"}},
                    {"name": "createdBy", "kind": {"type": "string"}, "required": false},
                    {"name": "password", "kind": {"type": "string"}, "required": false}
                ],
                "domains": [
                    {"name": "orders", "fields": [{"name": "total", "kind": {"type": "number"}}], "exclude": ["password"]},
                    {"name": "users", "fields": [{"name": "id", "kind": {"type": "string"}}], "unknown": "deny"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(registry.domains(), vec!["orders", "users"]);

        let orders = registry.get("orders").unwrap();
        let names: Vec<&str> = orders.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "createdBy", "total"]);

        let users = registry.get("users").unwrap();
        assert_eq!(users.field("id").unwrap().kind, FieldKind::String);
        assert_eq!(users.unknown, UnknownKeys::Deny);
        assert!(users.field("password").is_some());

        assert!(matches!(registry.schema("missing"), Err(BusError::Config(_))));
    }

    #[test]
    fn registry_rejects_bad_declarations() {
        let dup = SchemaConfig {
            shared: vec![],
            domains: vec![
                DomainSchema { name: "a".into(), fields: vec![], exclude: vec![], unknown: UnknownKeys::Allow },
                DomainSchema { name: "a".into(), fields: vec![], exclude: vec![], unknown: UnknownKeys::Allow },
            ],
        };
        assert!(matches!(SchemaRegistry::build(dup), Err(BusError::Config(_))));

        let bad_exclude = SchemaConfig {
            shared: vec![],
            domains: vec![DomainSchema {
                name: "a".into(),
                fields: vec![],
                exclude: vec!["ghost".into()],
                unknown: UnknownKeys::Allow,
            }],
        };
        assert!(matches!(SchemaRegistry::build(bad_exclude), Err(BusError::Config(_))));
    }
}
