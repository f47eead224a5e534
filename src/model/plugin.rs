use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::document::{LoadError, SchemaVersion};

/// Type tag of the placeholder standing in for unresolvable components.
pub const PLACEHOLDER_TYPE: &str = "EmptyComponent";

/// A polymorphic configuration node: what to run (`applications`) or
/// where/how to run it (`backends`). The concrete shape is described by a
/// registered plugin; the spec itself is just the tag plus attribute maps.
///
/// `fields` holds user configuration, frozen once submission starts.
/// `runtime` holds backend-assigned values (external id, queue name, exit
/// code) and is cleared on resubmit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    pub version: SchemaVersion,
    pub category: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub runtime: Map<String, Value>,
}

impl ComponentSpec {
    pub fn minimal(category: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            version: SchemaVersion::new(1, 0),
            category: category.into(),
            fields: Map::new(),
            runtime: Map::new(),
        }
    }

    /// Placeholder produced when a component cannot be resolved. The
    /// original tag is preserved so the record can be inspected and
    /// re-saved without losing information about what it was.
    pub fn placeholder(category: impl Into<String>, original_type: &str) -> Self {
        let mut spec = Self::minimal(category, PLACEHOLDER_TYPE);
        spec.fields
            .insert("original_type".into(), Value::String(original_type.into()));
        spec
    }

    pub fn is_placeholder(&self) -> bool {
        self.type_name == PLACEHOLDER_TYPE
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn set_runtime(&mut self, name: impl Into<String>, value: Value) {
        self.runtime.insert(name.into(), value);
    }

    pub fn runtime_str(&self, name: &str) -> Option<&str> {
        self.runtime.get(name).and_then(Value::as_str)
    }

    /// Drop backend-assigned values; called before resubmission.
    pub fn reset_runtime_fields(&mut self) {
        self.runtime.clear();
    }
}

/// Schema of one registered component type.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub category: String,
    pub type_name: String,
    pub version: SchemaVersion,
    /// Default field values, applied for attributes missing from older
    /// records of the same major version.
    pub defaults: Map<String, Value>,
}

impl PluginDescriptor {
    pub fn new(
        category: impl Into<String>,
        type_name: impl Into<String>,
        version: SchemaVersion,
    ) -> Self {
        Self {
            category: category.into(),
            type_name: type_name.into(),
            version,
            defaults: Map::new(),
        }
    }

    pub fn with_default(mut self, name: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }
}

/// Open registry mapping `(category, type tag)` to a component schema.
/// Deserialization resolves tags through it; unknown tags become
/// placeholders instead of failures.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: HashMap<(String, String), PluginDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the component types the core ships with.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            PluginDescriptor::new("applications", "Executable", SchemaVersion::new(1, 0))
                .with_default("exe", Value::String("/bin/sh".into()))
                .with_default("args", Value::Array(Vec::new())),
        );
        registry.register(PluginDescriptor::new(
            "backends",
            "Local",
            SchemaVersion::new(1, 0),
        ));
        registry
    }

    pub fn register(&mut self, descriptor: PluginDescriptor) {
        let key = (descriptor.category.clone(), descriptor.type_name.clone());
        self.plugins.insert(key, descriptor);
    }

    pub fn lookup(&self, category: &str, type_name: &str) -> Option<&PluginDescriptor> {
        self.plugins
            .get(&(category.to_string(), type_name.to_string()))
    }

    /// Construct a fresh spec of a registered type with schema defaults.
    pub fn build(&self, category: &str, type_name: &str) -> Option<ComponentSpec> {
        self.lookup(category, type_name).map(|d| ComponentSpec {
            type_name: d.type_name.clone(),
            version: d.version,
            category: d.category.clone(),
            fields: d.defaults.clone(),
            runtime: Map::new(),
        })
    }

    /// Reconcile a deserialized spec against the registered schema.
    ///
    /// Unknown tags and incompatible major versions are replaced by a
    /// placeholder and reported through `errors` under `path`; older
    /// records of the same major version get missing fields filled from
    /// schema defaults. Never fails.
    pub fn reconcile(
        &self,
        mut spec: ComponentSpec,
        path: &str,
        errors: &mut Vec<LoadError>,
    ) -> ComponentSpec {
        if spec.is_placeholder() {
            return spec;
        }
        let Some(descriptor) = self.lookup(&spec.category, &spec.type_name) else {
            errors.push(LoadError::new(
                path,
                format!(
                    "unknown plugin '{}' in category '{}'",
                    spec.type_name, spec.category
                ),
            ));
            return ComponentSpec::placeholder(spec.category.clone(), &spec.type_name);
        };
        if !spec.version.is_loadable(descriptor.version) {
            errors.push(LoadError::new(
                path,
                format!(
                    "schema version {} of '{}' is not loadable (current {})",
                    spec.version, spec.type_name, descriptor.version
                ),
            ));
            return ComponentSpec::placeholder(spec.category.clone(), &spec.type_name);
        }
        for (name, value) in &descriptor.defaults {
            if !spec.fields.contains_key(name) {
                spec.fields.insert(name.clone(), value.clone());
            }
        }
        spec.version = descriptor.version;
        spec
    }
}
