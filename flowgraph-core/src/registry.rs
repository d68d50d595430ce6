//! Node type registry.
//!
//! Constructed once at start-up and shared by `Arc` with every
//! [`CommandStore`](crate::store::CommandStore) that needs it.

use indexmap::IndexMap;

use crate::command::CommandError;
use crate::model::Size;

/// Size used for types the registry does not know.
pub const FALLBACK_NODE_SIZE: Size = Size { width: 180.0, height: 64.0 };

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTypeSpec {
    pub name: String,
    pub label: String,
    pub category: String,
    pub default_size: Size,
}

impl NodeTypeSpec {
    pub fn new(name: impl Into<String>, label: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            category: category.into(),
            default_size: FALLBACK_NODE_SIZE,
        }
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.default_size = size;
        self
    }
}

/// Known node types. A strict registry rejects unknown type tags; a
/// permissive one accepts them with the fallback size.
#[derive(Debug, Clone)]
pub struct NodeTypeRegistry {
    types: IndexMap<String, NodeTypeSpec>,
    strict: bool,
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl NodeTypeRegistry {
    /// Empty, permissive registry.
    pub fn new() -> Self {
        Self { types: IndexMap::new(), strict: false }
    }

    /// Permissive registry preloaded with the built-in workflow types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for spec in [
            NodeTypeSpec::new("start", "Start", "flow").with_size(Size::new(120.0, 48.0)),
            NodeTypeSpec::new("end", "End", "flow").with_size(Size::new(120.0, 48.0)),
            NodeTypeSpec::new("action", "Action", "steps"),
            NodeTypeSpec::new("condition", "Condition", "logic").with_size(Size::new(160.0, 96.0)),
            NodeTypeSpec::new("loop", "Loop", "logic").with_size(Size::new(200.0, 120.0)),
            NodeTypeSpec::new("transform", "Transform", "data"),
            NodeTypeSpec::new("delay", "Delay", "flow"),
            NodeTypeSpec::new("webhook", "Webhook", "integrations"),
            NodeTypeSpec::new("note", "Note", "annotations").with_size(Size::new(220.0, 140.0)),
        ] {
            registry.register(spec);
        }
        registry
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Register or replace a type. Returns the replaced spec.
    pub fn register(&mut self, spec: NodeTypeSpec) -> Option<NodeTypeSpec> {
        self.types.insert(spec.name.clone(), spec)
    }

    pub fn get(&self, name: &str) -> Option<&NodeTypeSpec> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &NodeTypeSpec> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn validate(&self, node_type: &str) -> Result<(), CommandError> {
        if node_type.trim().is_empty() || (self.strict && !self.contains(node_type)) {
            return Err(CommandError::UnknownNodeType(node_type.to_string()));
        }
        Ok(())
    }

    pub fn default_size(&self, node_type: &str) -> Size {
        self.get(node_type).map_or(FALLBACK_NODE_SIZE, |spec| spec.default_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_permissive() {
        let registry = NodeTypeRegistry::with_defaults();
        assert!(registry.contains("condition"));
        assert!(registry.validate("custom-plugin").is_ok());
        assert_eq!(registry.default_size("custom-plugin"), FALLBACK_NODE_SIZE);
        assert_eq!(registry.default_size("start"), Size::new(120.0, 48.0));
    }

    #[test]
    fn test_strict_registry_rejects_unknown_types() {
        let registry = NodeTypeRegistry::with_defaults().strict(true);
        assert_eq!(
            registry.validate("custom-plugin"),
            Err(CommandError::UnknownNodeType("custom-plugin".into()))
        );
        assert!(registry.validate("action").is_ok());
    }

    #[test]
    fn test_blank_type_is_always_rejected() {
        assert!(NodeTypeRegistry::new().validate(" ").is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = NodeTypeRegistry::new();
        assert!(registry.register(NodeTypeSpec::new("llm", "LLM", "ai")).is_none());
        let old = registry.register(NodeTypeSpec::new("llm", "Model call", "ai"));
        assert_eq!(old.unwrap().label, "LLM");
        assert_eq!(registry.len(), 1);
    }
}
