//! Shadow components: live mirrors created by `copy` expansion.
//!
//! A shadow's state variables are rewired with forwarding definitions that
//! read the source and invert back through it, so values flow from the
//! source and update requests flow back to the source's essential storage.

use std::sync::Arc;

use crate::arena::ComponentIdx;
use crate::component::{Component, ShadowSource};
use crate::definition::{
    DefinitionResult, DepTarget, DependencySpec, InverseDefinition, InverseInstruction,
    InverseResult, StateVarDefinition,
};
use crate::error::CoreError;
use crate::state::StateVar;
use crate::value::StateValue;

use crate::core::DocumentCore;

impl DocumentCore {
    /// Expand a `copy` composite into a shadow of its target.
    ///
    /// A composite target is expanded first and the shadow attaches to its
    /// first visible replacement; a target chain that loops back into a
    /// composite currently being expanded is a cycle.
    pub(crate) fn create_shadow_replacement(
        &mut self,
        composite: ComponentIdx,
        source: ComponentIdx,
        prop: Option<String>,
    ) -> Result<(), CoreError> {
        let source = self.resolve_shadow_source(composite, source)?;
        self.check_shadow_chain(composite, source)?;

        let (type_tag, parent, ancestors) = {
            let component = self
                .components
                .get(source)
                .ok_or(CoreError::ComponentNotFound(source))?;
            let composite = self
                .components
                .get(composite)
                .ok_or(CoreError::ComponentNotFound(composite))?;
            (
                component.component_type,
                composite.parent,
                composite.ancestors.clone(),
            )
        };
        let type_def = self
            .registry
            .get(type_tag)
            .ok_or_else(|| CoreError::UnknownComponentType(type_tag.into()))?;

        let idx = self.components.reserve();
        let mut shadow = Component::new(idx, type_def.type_tag, parent, ancestors);
        shadow.shadows = Some(ShadowSource {
            source,
            prop: prop.clone(),
        });
        for template in &type_def.state {
            let forwarded = prop.as_deref().map_or(true, |p| p == template.name);
            let var = if forwarded {
                forwarding_state_var(source, template.name.clone(), template.for_renderer)
            } else {
                template.instantiate()
            };
            shadow.state.insert(template.name.clone(), var);
        }
        self.components.fill(idx, shadow)?;

        if let Some(component) = self.components.get_mut(source) {
            component.shadowed_by.push(idx);
        }
        self.finish_adding(&[idx])?;
        if let Some(component) = self.components.get_mut(composite) {
            component.replacements = vec![idx];
        }
        Ok(())
    }

    /// Follow composite targets down to a concrete component.
    fn resolve_shadow_source(
        &mut self,
        composite: ComponentIdx,
        mut source: ComponentIdx,
    ) -> Result<ComponentIdx, CoreError> {
        loop {
            let component = self
                .components
                .get(source)
                .ok_or(CoreError::ComponentNotFound(source))?;
            if !component.is_composite {
                return Ok(source);
            }
            if source == composite || self.expansion_in_progress.contains(&source) {
                return Err(CoreError::Cycle {
                    path: vec![composite.to_string(), source.to_string()],
                });
            }
            if !component.is_expanded {
                self.expand_composite(source)?;
            }
            let component = self
                .components
                .get(source)
                .ok_or(CoreError::ComponentNotFound(source))?;
            match component.visible_replacements().first() {
                Some(&replacement) => source = replacement,
                None => {
                    return Err(CoreError::User(anyhow::anyhow!(
                        "copy target {source} has no replacements"
                    )))
                }
            }
        }
    }

    /// Reject a shadow whose source chain loops back on itself or on the
    /// copy being expanded.
    fn check_shadow_chain(
        &self,
        composite: ComponentIdx,
        source: ComponentIdx,
    ) -> Result<(), CoreError> {
        let mut seen = vec![composite];
        let mut walk = source;
        loop {
            if seen.contains(&walk) {
                let mut path: Vec<String> = seen.iter().map(|c| c.to_string()).collect();
                path.push(walk.to_string());
                return Err(CoreError::Cycle { path });
            }
            seen.push(walk);
            match self
                .components
                .get(walk)
                .and_then(|c| c.shadows.as_ref())
            {
                Some(shadow) => walk = shadow.source,
                None => return Ok(()),
            }
        }
    }

    /// Mirror an essential write on a source into its shadows.
    ///
    /// Prop-scoped shadows receive only writes for their one variable.
    pub(crate) fn sync_essential_to_shadows(
        &mut self,
        idx: ComponentIdx,
        key: &str,
        value: &StateValue,
    ) -> Result<(), CoreError> {
        let shadows = match self.components.get(idx) {
            Some(component) => component.shadowed_by.clone(),
            None => return Ok(()),
        };
        for shadow in shadows {
            let applies = self
                .components
                .get(shadow)
                .and_then(|c| c.shadows.as_ref())
                .map(|s| match &s.prop {
                    Some(prop) => {
                        key == prop || key.starts_with(&format!("{prop}:"))
                    }
                    None => true,
                })
                .unwrap_or(false);
            if applies {
                self.write_essential_storage(shadow, key, value.clone(), None)?;
            }
        }
        Ok(())
    }
}

/// A definition that mirrors one variable of the source component, with an
/// inverse that forwards the desired value back to it. Essential writes are
/// disabled: a shadow storing its own essential value would silently
/// diverge from its source.
fn forwarding_state_var(source: ComponentIdx, name: String, for_renderer: bool) -> StateVar {
    let produced = name.clone();
    let definition = Arc::new(StateVarDefinition {
        dependencies: vec![(
            "source".to_string(),
            DependencySpec::StateVar {
                target: DepTarget::Component(source),
                var: name.clone(),
            },
        )],
        calculate: Arc::new(move |deps| {
            Ok(DefinitionResult::new().with_value(produced.clone(), deps.value("source").clone()))
        }),
        array: None,
        produces: vec![name.clone()],
        mark_stale: None,
    });
    let mut var = StateVar::scalar(&name, definition);
    var.for_renderer = for_renderer;
    var.has_essential = false;
    var.essential_write_allowed = false;
    var.inverse = Some(Arc::new(InverseDefinition {
        invert: Arc::new(|ctx| {
            let Some(value) = ctx.desired.whole.clone() else {
                return Ok(InverseResult::failure());
            };
            Ok(InverseResult::with(vec![InverseInstruction::SetDependency {
                dependency: "source".to_string(),
                desired: value,
            }]))
        }),
        essential_write_allowed: false,
    }));
    var
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialized::SerializedComponent;

    fn build_copy_pair() -> (DocumentCore, ComponentIdx, ComponentIdx) {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("number")
            .with_name("a")
            .with_state("value", 5i64)])
            .unwrap();
        let source = core.roots[0];
        core.build(vec![
            SerializedComponent::new("copy").with_attribute("target", source.as_usize() as i64)
        ])
        .unwrap();
        let copy = core.roots[1];
        let shadow = core
            .components
            .get(copy)
            .unwrap()
            .visible_replacements()
            .first()
            .copied()
            .unwrap();
        (core, source, shadow)
    }

    #[test]
    fn test_shadow_forwards_source_value() {
        let (mut core, source, shadow) = build_copy_pair();
        assert_eq!(core.get_value(shadow, "value").unwrap(), StateValue::Integer(5));

        core.request_update(source, "value", 9i64, false).unwrap();
        assert_eq!(core.get_value(shadow, "value").unwrap(), StateValue::Integer(9));
    }

    #[test]
    fn test_update_through_shadow_lands_on_source() {
        let (mut core, source, shadow) = build_copy_pair();
        core.request_update(shadow, "value", 12i64, false).unwrap();
        assert_eq!(core.get_value(source, "value").unwrap(), StateValue::Integer(12));
        assert_eq!(core.get_value(shadow, "value").unwrap(), StateValue::Integer(12));
    }

    #[test]
    fn test_mutual_copies_degrade_to_error() {
        let mut core = DocumentCore::with_builtins();
        // Indices are assigned in document order, so each copy can target
        // the other by its eventual index.
        core.build(vec![
            SerializedComponent::new("copy").with_attribute("target", 1i64),
            SerializedComponent::new("copy").with_attribute("target", 0i64),
        ])
        .unwrap();
        let first = core.roots[0];
        let replacement = core
            .components
            .get(first)
            .unwrap()
            .visible_replacements()
            .first()
            .copied()
            .unwrap();
        let replacement_type = core.components.get(replacement).unwrap().component_type;
        assert_eq!(replacement_type, "_error");
        assert!(core
            .warnings
            .iter()
            .any(|w| w.message.contains("circular")));
    }
}
