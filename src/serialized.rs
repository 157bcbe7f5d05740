//! Serialized component trees, the input to a document build and the output
//! of composite replacement generation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::StateValue;

/// One node of a serialized component tree.
///
/// The same shape serves both entry points: embedders deserialize authored
/// documents into it, and composite types construct it programmatically when
/// generating replacements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SerializedComponent {
    /// Registry type tag.
    #[serde(rename = "type")]
    pub component_type: String,
    /// Author-assigned name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Literal attribute values.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: IndexMap<String, StateValue>,
    /// Child nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SerializedComponent>,
    /// Seed values for essential storage, keyed by variable name. A `List`
    /// seeding an array variable is exploded into per-key essentials at
    /// build time.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub state: IndexMap<String, StateValue>,
}

impl SerializedComponent {
    /// A node of the given type with nothing else set.
    pub fn new(component_type: impl Into<String>) -> Self {
        Self {
            component_type: component_type.into(),
            ..Default::default()
        }
    }

    /// Set the name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add a child.
    pub fn with_child(mut self, child: SerializedComponent) -> Self {
        self.children.push(child);
        self
    }

    /// Seed essential state for one variable.
    pub fn with_state(mut self, var: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.state.insert(var.into(), value.into());
        self
    }

    /// The `_error` placeholder substituted for content that failed to
    /// build.
    pub fn error_placeholder(message: impl Into<String>) -> Self {
        SerializedComponent::new("_error").with_state("message", message.into())
    }
}
