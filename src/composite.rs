//! Composite expansion: materializing replacements and re-diffing them
//! incrementally when the driving state changes.

use tracing::warn;

use crate::arena::ComponentIdx;
use crate::error::{CoreError, CoreWarning};
use crate::resolver::IndexResolution;
use crate::serialized::SerializedComponent;
use crate::value::StateValue;

use crate::core::DocumentCore;

/// Iteration cap on replacement propagation. A composite whose replacements
/// keep triggering further replacement updates past this bound is rejected
/// with [`CoreError::ReplacementLoop`].
pub const MAX_REPLACEMENT_ITERATIONS: usize = 100;

/// How replacement shrinkage is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementPolicy {
    /// Keep shrunk-away replacements materialized but hidden, so growing
    /// back restores the same components with their state intact.
    #[default]
    Withhold,
    /// Delete shrunk-away replacements outright.
    Delete,
}

/// What a composite expands into.
pub enum ReplacementSource {
    /// Serialized subtrees to materialize.
    Serialized(Vec<SerializedComponent>),
    /// A shadow of another component.
    Shadow {
        /// The component to shadow.
        source: ComponentIdx,
        /// Restrict the shadow to one variable of the source.
        prop: Option<String>,
    },
}

/// One incremental edit to a composite's replacement list.
pub enum ReplacementChange {
    /// Insert serialized subtrees at a position in the replacement list.
    Add {
        /// Insertion position.
        index: usize,
        /// Subtrees to materialize.
        components: Vec<SerializedComponent>,
    },
    /// Remove specific replacements.
    Delete {
        /// The replacements to remove.
        indices: Vec<ComponentIdx>,
    },
    /// Drive one variable of an existing replacement toward a new value,
    /// through the normal two-way-binding path.
    UpdateState {
        /// The replacement to update.
        component: ComponentIdx,
        /// Target variable.
        variable: String,
        /// Desired value.
        value: StateValue,
    },
    /// Set the number of trailing replacements hidden from the active tree
    /// (or deleted, under [`ReplacementPolicy::Delete`]).
    ChangeWithheld {
        /// New withheld count.
        count: usize,
    },
}

impl DocumentCore {
    /// Drain the replacement queue, expanding and re-diffing composites
    /// until it settles or the iteration cap trips.
    pub(crate) fn process_replacement_queue(&mut self) -> Result<(), CoreError> {
        let mut iterations = 0;
        while !self.queues.replacements.is_empty() {
            iterations += 1;
            if iterations > MAX_REPLACEMENT_ITERATIONS {
                return Err(CoreError::ReplacementLoop {
                    max: MAX_REPLACEMENT_ITERATIONS,
                });
            }
            let batch: Vec<ComponentIdx> =
                std::mem::take(&mut self.queues.replacements).into_iter().collect();
            for idx in batch {
                let Some(component) = self.components.get(idx) else {
                    continue;
                };
                if !component.is_composite {
                    continue;
                }
                if component.is_expanded {
                    self.update_composite_replacements(idx)?;
                } else {
                    self.expand_composite(idx)?;
                }
            }
        }
        Ok(())
    }

    /// Expand one composite for the first time.
    ///
    /// Re-entrant calls for the same composite are no-ops; the in-progress
    /// set also lets mutually referencing copies detect their cycle. A
    /// failing generator degrades to an `_error` replacement.
    pub(crate) fn expand_composite(&mut self, idx: ComponentIdx) -> Result<(), CoreError> {
        if self.expansion_in_progress.contains(&idx) {
            return Ok(());
        }
        self.expansion_in_progress.insert(idx);
        let result = self.expand_composite_guarded(idx);
        self.expansion_in_progress.remove(&idx);
        result
    }

    fn expand_composite_guarded(&mut self, idx: ComponentIdx) -> Result<(), CoreError> {
        let type_def = {
            let component = self
                .components
                .get(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            self.registry
                .get(component.component_type)
                .ok_or_else(|| CoreError::UnknownComponentType(component.component_type.into()))?
        };
        let Some(create) = type_def.create_replacements.clone() else {
            if let Some(component) = self.components.get_mut(idx) {
                component.is_expanded = true;
            }
            return Ok(());
        };

        let outcome = self
            .expand_gate(idx)
            .and_then(|_| create(self, idx).map_err(CoreError::User));

        match outcome {
            Ok(ReplacementSource::Serialized(nodes)) => {
                let replacements = self.install_replacements(idx, nodes)?;
                if let Some(component) = self.components.get_mut(idx) {
                    component.replacements = replacements;
                }
            }
            Ok(ReplacementSource::Shadow { source, prop }) => {
                if let Err(err) = self.create_shadow_replacement(idx, source, prop) {
                    self.install_error_replacement(idx, err.to_string())?;
                }
            }
            Err(err @ CoreError::ReplacementLoop { .. }) => return Err(err),
            Err(err) => {
                self.install_error_replacement(idx, err.to_string())?;
            }
        }

        if let Some(component) = self.components.get_mut(idx) {
            component.is_expanded = true;
        }
        self.after_replacements_changed(idx)
    }

    /// Freshen the readiness gate before expansion, when the type has one.
    fn expand_gate(&mut self, idx: ComponentIdx) -> Result<(), CoreError> {
        let has_gate = self
            .components
            .get(idx)
            .map(|c| c.state.contains_key("readyToExpandWhenResolved"))
            .unwrap_or(false);
        if has_gate {
            self.get_value(idx, "readyToExpandWhenResolved")?;
        }
        Ok(())
    }

    /// Re-diff an already expanded composite against its driving state.
    pub(crate) fn update_composite_replacements(
        &mut self,
        idx: ComponentIdx,
    ) -> Result<(), CoreError> {
        let type_def = {
            let component = self
                .components
                .get(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            self.registry
                .get(component.component_type)
                .ok_or_else(|| CoreError::UnknownComponentType(component.component_type.into()))?
        };
        let Some(calculate) = type_def.calculate_replacement_changes.clone() else {
            return Ok(());
        };
        self.expand_gate(idx)?;
        match calculate(self, idx) {
            Ok(changes) => {
                if changes.is_empty() {
                    return Ok(());
                }
                self.apply_replacement_changes(idx, changes)?;
                self.after_replacements_changed(idx)
            }
            Err(err) => {
                warn!(composite = %idx, error = %err, "replacement re-diff failed");
                self.warnings.push(CoreWarning::new(
                    idx,
                    format!("could not update replacements: {err}"),
                ));
                Ok(())
            }
        }
    }

    fn apply_replacement_changes(
        &mut self,
        idx: ComponentIdx,
        changes: Vec<ReplacementChange>,
    ) -> Result<(), CoreError> {
        for change in changes {
            match change {
                ReplacementChange::Add { index, components } => {
                    let fresh = self.install_replacements(idx, components)?;
                    if let Some(component) = self.components.get_mut(idx) {
                        let at = index.min(component.replacements.len());
                        component.replacements.splice(at..at, fresh);
                    }
                }
                ReplacementChange::Delete { indices } => {
                    if let Some(component) = self.components.get_mut(idx) {
                        component.replacements.retain(|r| !indices.contains(r));
                    }
                    self.delete_components(&indices)?;
                }
                ReplacementChange::UpdateState {
                    component,
                    variable,
                    value,
                } => {
                    self.request_change(component, &variable, value)?;
                }
                ReplacementChange::ChangeWithheld { count } => match self.scope_config().replacement_policy {
                    ReplacementPolicy::Withhold => {
                        if let Some(component) = self.components.get_mut(idx) {
                            component.replacements_to_withhold = count;
                        }
                    }
                    ReplacementPolicy::Delete => {
                        let doomed: Vec<ComponentIdx> = {
                            let Some(component) = self.components.get_mut(idx) else {
                                continue;
                            };
                            let keep = component.replacements.len().saturating_sub(count);
                            component.replacements_to_withhold = 0;
                            component.replacements.split_off(keep)
                        };
                        self.delete_components(&doomed)?;
                    }
                },
            }
        }
        Ok(())
    }

    /// Materialize serialized replacement subtrees. Replacements join the
    /// tree beside the composite: same parent, same ancestors.
    pub(crate) fn install_replacements(
        &mut self,
        idx: ComponentIdx,
        nodes: Vec<SerializedComponent>,
    ) -> Result<Vec<ComponentIdx>, CoreError> {
        let (parent, ancestors) = {
            let component = self
                .components
                .get(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            (component.parent, component.ancestors.clone())
        };
        let mut created = Vec::new();
        let mut replacements = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let replacement =
                self.create_component_tree(node, parent, ancestors.clone(), &mut created)?;
            replacements.push(replacement);
        }
        self.finish_adding(&created)?;
        Ok(replacements)
    }

    /// Replace a composite's expansion with an `_error` placeholder.
    pub(crate) fn install_error_replacement(
        &mut self,
        idx: ComponentIdx,
        message: String,
    ) -> Result<(), CoreError> {
        warn!(composite = %idx, message = %message, "composite expansion failed");
        self.warnings.push(CoreWarning::new(idx, message.clone()));
        let replacements = self
            .install_replacements(idx, vec![SerializedComponent::error_placeholder(message)])?;
        if let Some(component) = self.components.get_mut(idx) {
            component.replacements = replacements;
        }
        Ok(())
    }

    /// After a composite's replacement list changed: rebuild the parent's
    /// active children and republish the index resolution.
    pub(crate) fn after_replacements_changed(&mut self, idx: ComponentIdx) -> Result<(), CoreError> {
        let (parent, visible) = {
            let component = self
                .components
                .get(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            (component.parent, component.visible_replacements().to_vec())
        };
        if let Some(parent) = parent {
            self.recompute_active_children(parent)?;
            self.queues.children_changed.insert(parent);
        }
        self.resolver.replace_index_resolutions(&[IndexResolution {
            composite: idx,
            replacements: visible,
        }]);
        Ok(())
    }

    /// Derive one component's active child list from its defining children,
    /// substituting expanded composites with their visible replacements.
    pub(crate) fn recompute_active_children(&mut self, idx: ComponentIdx) -> Result<(), CoreError> {
        let (defining, accepted) = {
            let component = self
                .components
                .get(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            let accepted = self
                .registry
                .get(component.component_type)
                .map(|def| def.accepted_child_types.clone())
                .unwrap_or_default();
            (component.defining_children.clone(), accepted)
        };

        let mut active = Vec::new();
        self.collect_active(&defining, &mut active);

        if !accepted.is_empty() {
            let mut kept = Vec::with_capacity(active.len());
            for child in active {
                let matches = self
                    .components
                    .get(child)
                    .map(|c| {
                        accepted.contains(&c.component_type)
                            || self
                                .registry
                                .get(c.component_type)
                                .map(|def| {
                                    def.adapts_to.iter().any(|t| accepted.contains(t))
                                })
                                .unwrap_or(false)
                    })
                    .unwrap_or(false);
                if matches {
                    kept.push(child);
                } else {
                    self.warnings.push(CoreWarning::new(
                        child,
                        "child type not accepted by parent; excluded from active children"
                            .to_string(),
                    ));
                }
            }
            active = kept;
        }

        let mut list_changed = false;
        if let Some(component) = self.components.get_mut(idx) {
            if component.active_children != active {
                component.active_children = active;
                list_changed = true;
            }
        }
        if list_changed {
            self.queues.renderer_children.insert(idx);
        }
        Ok(())
    }

    fn collect_active(&self, children: &[ComponentIdx], out: &mut Vec<ComponentIdx>) {
        for &child in children {
            let Some(component) = self.components.get(child) else {
                continue;
            };
            if component.is_composite && component.is_expanded {
                let visible = component.visible_replacements().to_vec();
                self.collect_active(&visible, out);
            } else {
                out.push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_expands_to_length_replacements() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("sequence")
            .with_attribute("length", 3i64)])
            .unwrap();
        let seq = core.roots[0];
        let component = core.components.get(seq).unwrap();
        assert!(component.is_expanded);
        assert_eq!(component.visible_replacements().len(), 3);

        let replacements = component.visible_replacements().to_vec();
        for (i, r) in replacements.iter().enumerate() {
            assert_eq!(
                core.get_value(*r, "value").unwrap(),
                StateValue::Integer(i as i64 + 1)
            );
        }
    }

    #[test]
    fn test_sequence_replacements_substitute_in_parent() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("sum")
            .with_child(SerializedComponent::new("sequence").with_attribute("length", 4i64))])
            .unwrap();
        let sum = core.roots[0];
        assert_eq!(
            core.components.get(sum).unwrap().active_children.len(),
            4
        );
        assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 10.0);
    }

    #[test]
    fn test_update_state_change_drives_a_replacement() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("sequence")
            .with_attribute("length", 2i64)])
            .unwrap();
        let seq = core.roots[0];
        let first = core.components.get(seq).unwrap().visible_replacements()[0];

        core.apply_replacement_changes(
            seq,
            vec![ReplacementChange::UpdateState {
                component: first,
                variable: "value".into(),
                value: StateValue::Integer(99),
            }],
        )
        .unwrap();
        assert_eq!(core.get_value(first, "value").unwrap(), StateValue::Integer(99));
    }

    #[test]
    fn test_withhold_policy_preserves_identity_across_shrink_and_grow() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("sequence")
            .with_attribute("length", 5i64)])
            .unwrap();
        let seq = core.roots[0];
        let before = core.components.get(seq).unwrap().visible_replacements().to_vec();
        assert_eq!(before.len(), 5);

        core.request_update(seq, "length", 2i64, false).unwrap();
        {
            let component = core.components.get(seq).unwrap();
            assert_eq!(component.visible_replacements(), &before[..2]);
            assert_eq!(component.replacements.len(), 5);
        }

        core.request_update(seq, "length", 4i64, false).unwrap();
        let component = core.components.get(seq).unwrap();
        assert_eq!(component.visible_replacements(), &before[..4]);
    }

    #[test]
    fn test_delete_policy_drops_the_shrunk_suffix() {
        use crate::core::ScopeConfig;

        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("sequence")
            .with_attribute("length", 5i64)])
            .unwrap();
        let seq = core.roots[0];
        let before = core.components.get(seq).unwrap().visible_replacements().to_vec();

        core.push_scope_config(ScopeConfig {
            replacement_policy: ReplacementPolicy::Delete,
            ..ScopeConfig::default()
        });
        core.request_update(seq, "length", 2i64, false).unwrap();
        core.pop_scope_config();

        let component = core.components.get(seq).unwrap();
        assert_eq!(component.replacements.len(), 2);
        assert_eq!(component.replacements_to_withhold, 0);
        assert!(!core.components.contains(before[4]));
        assert_eq!(core.scope_config(), ScopeConfig::default());
    }

    #[test]
    fn test_replacement_loop_trips_the_iteration_cap() {
        use std::sync::Arc;

        use indexmap::IndexMap;

        use crate::definition::{
            DefinitionResult, DepTarget, DependencySpec, FreshnessVerdict, MarkStaleResult,
            SideEffects, StateVarDefinition,
        };
        use crate::registry::{ComponentRegistry, ComponentTypeDef, StateVarTemplate, TemplateKind};
        use crate::resolver::NoopResolver;

        // A composite whose every re-diff leaves more work on the queue.
        let def = ComponentTypeDef {
            type_tag: "restless",
            is_composite: true,
            accepted_child_types: vec![],
            adapts_to: vec![],
            state: vec![
                StateVarTemplate::essential_scalar("tick", 0i64),
                StateVarTemplate {
                    name: "readyToExpandWhenResolved".into(),
                    kind: TemplateKind::Scalar,
                    definition: Arc::new(StateVarDefinition {
                        dependencies: vec![(
                            "tick".into(),
                            DependencySpec::StateVar {
                                target: DepTarget::SelfComponent,
                                var: "tick".into(),
                            },
                        )],
                        calculate: Arc::new(|_| {
                            Ok(DefinitionResult::new()
                                .with_value("readyToExpandWhenResolved", true))
                        }),
                        array: None,
                        produces: vec!["readyToExpandWhenResolved".into()],
                        mark_stale: Some(Arc::new(|_| MarkStaleResult {
                            verdict: FreshnessVerdict::Stale,
                            side_effects: SideEffects {
                                update_replacements: true,
                                ..Default::default()
                            },
                        })),
                    }),
                    inverse: None,
                    for_renderer: false,
                    default_value: StateValue::Bool(false),
                    has_essential: false,
                    fixed: true,
                    fix_location: false,
                    modify_indirectly: false,
                },
            ],
            actions: IndexMap::new(),
            create_replacements: Some(Arc::new(|_, _| {
                Ok(ReplacementSource::Serialized(vec![]))
            })),
            calculate_replacement_changes: Some(Arc::new(|core, idx| {
                core.queues.replacements.insert(idx);
                Ok(vec![])
            })),
        };

        let mut registry = ComponentRegistry::with_builtins();
        registry.register(def);
        let mut core = DocumentCore::new(registry, Box::new(NoopResolver));
        core.build(vec![SerializedComponent::new("restless")]).unwrap();
        let root = core.roots[0];

        // The update itself lands, the runaway re-diff is rejected at the
        // cap, and the drain degrades the failure to a warning.
        core.request_update(root, "tick", 1i64, false).unwrap();
        let warnings = core.take_warnings();
        assert!(warnings.iter().any(|w| w.message.contains("did not settle")));
        assert_eq!(core.get_value(root, "tick").unwrap(), StateValue::Integer(1));
    }
}
