//! The component: a tree node carrying state variables and essential state.

use indexmap::IndexMap;

use crate::arena::ComponentIdx;
use crate::state::StateVar;
use crate::value::StateValue;

/// What a shadow component mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowSource {
    /// The component being shadowed.
    pub source: ComponentIdx,
    /// When present, the shadow mirrors only this one variable of the
    /// source instead of its whole state.
    pub prop: Option<String>,
}

/// A live node of the component tree.
///
/// Two child lists coexist: `defining_children` is the authored list and
/// never changes after construction, while `active_children` is the derived
/// list dependencies actually read, with expanded composites substituted by
/// their visible replacements.
#[derive(Debug)]
pub struct Component {
    /// This component's own index.
    pub idx: ComponentIdx,
    /// Registry type tag.
    pub component_type: &'static str,
    /// Author-assigned name, unique within the document when present.
    pub name: Option<String>,
    /// Parent in the tree, absent for roots.
    pub parent: Option<ComponentIdx>,
    /// Ancestor chain, nearest first.
    pub ancestors: Vec<ComponentIdx>,
    /// Authored child list, fixed at construction.
    pub defining_children: Vec<ComponentIdx>,
    /// Derived child list with composites substituted by replacements.
    pub active_children: Vec<ComponentIdx>,
    /// Authored attributes, literal values only.
    pub attributes: IndexMap<String, StateValue>,
    /// Components materialized from component-valued attributes. They are
    /// owned here, outside both child lists.
    pub attribute_components: Vec<ComponentIdx>,
    /// State variables by name, declaration order preserved.
    pub state: IndexMap<String, StateVar>,
    /// Essential storage. Array elements live beside scalars under
    /// `var:key` keys.
    pub essential: IndexMap<String, StateValue>,
    /// Replacement components, for expanded composites.
    pub replacements: Vec<ComponentIdx>,
    /// Number of trailing replacements withheld from the active tree.
    pub replacements_to_withhold: usize,
    /// True once composite expansion has run for this component.
    pub is_expanded: bool,
    /// True for composite component types.
    pub is_composite: bool,
    /// Set when this component is a shadow of another.
    pub shadows: Option<ShadowSource>,
    /// Components shadowing this one.
    pub shadowed_by: Vec<ComponentIdx>,
}

impl Component {
    /// Create a bare component with empty child lists and no state.
    pub fn new(
        idx: ComponentIdx,
        component_type: &'static str,
        parent: Option<ComponentIdx>,
        ancestors: Vec<ComponentIdx>,
    ) -> Self {
        Self {
            idx,
            component_type,
            name: None,
            parent,
            ancestors,
            defining_children: Vec::new(),
            active_children: Vec::new(),
            attributes: IndexMap::new(),
            attribute_components: Vec::new(),
            state: IndexMap::new(),
            essential: IndexMap::new(),
            replacements: Vec::new(),
            replacements_to_withhold: 0,
            is_expanded: false,
            is_composite: false,
            shadows: None,
            shadowed_by: Vec::new(),
        }
    }

    /// Look up a state variable by name.
    pub fn state_var(&self, name: &str) -> Option<&StateVar> {
        self.state.get(name)
    }

    /// Look up a state variable mutably.
    pub fn state_var_mut(&mut self, name: &str) -> Option<&mut StateVar> {
        self.state.get_mut(name)
    }

    /// Replacements visible to the active tree: the full list minus the
    /// withheld suffix. Withheld replacements stay materialized so that
    /// restoring them later preserves their indices and essential state.
    pub fn visible_replacements(&self) -> &[ComponentIdx] {
        let visible = self
            .replacements
            .len()
            .saturating_sub(self.replacements_to_withhold);
        &self.replacements[..visible]
    }

    /// An authored attribute's value, if present.
    pub fn attribute(&self, name: &str) -> Option<&StateValue> {
        self.attributes.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_replacements_excludes_withheld_suffix() {
        let mut c = Component::new(ComponentIdx(0), "sequence", None, vec![]);
        c.replacements = vec![ComponentIdx(1), ComponentIdx(2), ComponentIdx(3)];
        c.replacements_to_withhold = 2;
        assert_eq!(c.visible_replacements(), &[ComponentIdx(1)]);

        c.replacements_to_withhold = 5;
        assert!(c.visible_replacements().is_empty());

        c.replacements_to_withhold = 0;
        assert_eq!(c.visible_replacements().len(), 3);
    }
}
