//! The resolver seam: an embedder-supplied index from authored names to
//! component indices, kept current as the tree changes.

use indexmap::IndexMap;

use crate::arena::ComponentIdx;
use crate::value::StateValue;

/// Structural summary of one component handed to the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverNode {
    /// The component's index.
    pub idx: ComponentIdx,
    /// Registry type tag.
    pub component_type: &'static str,
    /// Author-assigned name.
    pub name: Option<String>,
    /// Parent index.
    pub parent: Option<ComponentIdx>,
    /// Defining children.
    pub children: Vec<ComponentIdx>,
    /// Authored attributes.
    pub attributes: IndexMap<String, StateValue>,
}

/// An expanded composite and its current visible replacements, for
/// index-based name resolution through composites.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexResolution {
    /// The composite.
    pub composite: ComponentIdx,
    /// Its visible replacements, in order.
    pub replacements: Vec<ComponentIdx>,
}

/// Receives structural updates from the core.
///
/// Implementations maintain whatever index they need; the core never reads
/// back from the resolver, so a no-op implementation is valid.
pub trait Resolver {
    /// New components entered the tree.
    fn add_nodes(&mut self, nodes: &[ResolverNode]);

    /// Components left the tree. Their indices are never reused.
    fn delete_nodes(&mut self, indices: &[ComponentIdx]);

    /// A composite's visible replacements changed.
    fn replace_index_resolutions(&mut self, resolutions: &[IndexResolution]);
}

/// Resolver that ignores every update.
#[derive(Debug, Default)]
pub struct NoopResolver;

impl Resolver for NoopResolver {
    fn add_nodes(&mut self, _nodes: &[ResolverNode]) {}
    fn delete_nodes(&mut self, _indices: &[ComponentIdx]) {}
    fn replace_index_resolutions(&mut self, _resolutions: &[IndexResolution]) {}
}

/// Resolver maintaining a flat name-to-index map.
#[derive(Debug, Default)]
pub struct NameResolver {
    names: IndexMap<String, ComponentIdx>,
}

impl NameResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a component by authored name.
    pub fn resolve(&self, name: &str) -> Option<ComponentIdx> {
        self.names.get(name).copied()
    }

    /// All known names.
    pub fn names(&self) -> impl Iterator<Item = (&str, ComponentIdx)> {
        self.names.iter().map(|(n, &i)| (n.as_str(), i))
    }
}

impl Resolver for NameResolver {
    fn add_nodes(&mut self, nodes: &[ResolverNode]) {
        for node in nodes {
            if let Some(name) = &node.name {
                self.names.insert(name.clone(), node.idx);
            }
        }
    }

    fn delete_nodes(&mut self, indices: &[ComponentIdx]) {
        self.names.retain(|_, idx| !indices.contains(idx));
    }

    fn replace_index_resolutions(&mut self, _resolutions: &[IndexResolution]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_resolver_tracks_adds_and_deletes() {
        let mut resolver = NameResolver::new();
        resolver.add_nodes(&[ResolverNode {
            idx: ComponentIdx(3),
            component_type: "number",
            name: Some("a".into()),
            parent: None,
            children: vec![],
            attributes: IndexMap::new(),
        }]);
        assert_eq!(resolver.resolve("a"), Some(ComponentIdx(3)));

        resolver.delete_nodes(&[ComponentIdx(3)]);
        assert_eq!(resolver.resolve("a"), None);
    }
}
