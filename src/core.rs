//! The document core: owns the component tree, the dependency graph, and
//! the request queue, and coordinates the engine passes.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use tracing::warn;

use crate::arena::{ComponentIdx, ComponentTable};
use crate::array;
use crate::component::Component;
use crate::composite::ReplacementPolicy;
use crate::deps::{DependencyGraph, VarPointer};
use crate::error::{CoreError, CoreWarning};
use crate::queue::{ActionRequest, CoreRequest, RequestQueue};
use crate::registry::ComponentRegistry;
use crate::resolver::{Resolver, ResolverNode};
use crate::serialized::SerializedComponent;
use crate::value::StateValue;

/// Deferred work accumulated during a staleness walk and executed in a
/// batch once the walk finishes.
#[derive(Debug, Default)]
pub(crate) struct SideEffectQueues {
    /// Components whose renderer-flagged state must be re-sent.
    pub renderer: BTreeSet<ComponentIdx>,
    /// Components whose active child list changed since the renderer last
    /// saw them.
    pub renderer_children: BTreeSet<ComponentIdx>,
    /// Composites whose replacements must be re-diffed.
    pub replacements: BTreeSet<ComponentIdx>,
    /// Variables whose chained actions fired; drained by the embedder.
    pub action_chain: Vec<VarPointer>,
    /// Components whose dependencies must be set up again.
    pub dependency_setup: BTreeSet<ComponentIdx>,
    /// Components whose active child list changed.
    pub children_changed: BTreeSet<ComponentIdx>,
}

/// Ambient configuration scoped around recursive creation calls.
///
/// Pushed before creating a subtree and popped afterward; the innermost
/// scope wins. The root scope always exists.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScopeConfig {
    /// How replacement shrinkage is applied within the scope.
    pub replacement_policy: ReplacementPolicy,
    /// Seed available to replacement generators that need randomness.
    pub rng_seed: u64,
}

/// The reactive document engine.
pub struct DocumentCore {
    /// Live components.
    pub components: ComponentTable,
    /// Resolved dependency edges.
    pub deps: DependencyGraph,
    /// Known component types.
    pub registry: ComponentRegistry,
    /// Embedder name index.
    pub resolver: Box<dyn Resolver>,
    /// Root components, in document order.
    pub roots: Vec<ComponentIdx>,
    /// Accumulated non-fatal problems.
    pub warnings: Vec<CoreWarning>,
    /// Scoped ambient configuration; the last entry is the active scope.
    scope_config: Vec<ScopeConfig>,
    pub(crate) queue: RequestQueue,
    pub(crate) queues: SideEffectQueues,
    pub(crate) expansion_in_progress: BTreeSet<ComponentIdx>,
    /// Essential writes since the last drain of [`take_essential_changes`],
    /// for embedder persistence.
    ///
    /// [`take_essential_changes`]: DocumentCore::take_essential_changes
    pub(crate) essential_changes: IndexMap<(ComponentIdx, String), StateValue>,
}

impl DocumentCore {
    /// A core with the given registry and resolver and no components.
    pub fn new(registry: ComponentRegistry, resolver: Box<dyn Resolver>) -> Self {
        Self {
            components: ComponentTable::new(),
            deps: DependencyGraph::new(),
            registry,
            resolver,
            roots: Vec::new(),
            warnings: Vec::new(),
            scope_config: vec![ScopeConfig::default()],
            queue: RequestQueue::new(),
            queues: SideEffectQueues::default(),
            expansion_in_progress: BTreeSet::new(),
            essential_changes: IndexMap::new(),
        }
    }

    /// A core with the built-in types and a no-op resolver.
    pub fn with_builtins() -> Self {
        Self::new(
            ComponentRegistry::with_builtins(),
            Box::new(crate::resolver::NoopResolver),
        )
    }

    /// The active scope configuration.
    pub fn scope_config(&self) -> ScopeConfig {
        match self.scope_config.last() {
            Some(config) => *config,
            None => ScopeConfig::default(),
        }
    }

    /// Enter a creation scope with the given configuration.
    ///
    /// Every push must be paired with a [`pop_scope_config`] once the
    /// creation call it wraps returns.
    ///
    /// [`pop_scope_config`]: DocumentCore::pop_scope_config
    pub fn push_scope_config(&mut self, config: ScopeConfig) {
        self.scope_config.push(config);
    }

    /// Leave the innermost creation scope. The root scope is never popped.
    pub fn pop_scope_config(&mut self) {
        if self.scope_config.len() > 1 {
            self.scope_config.pop();
        }
    }

    /// Build the document from serialized roots.
    ///
    /// Content problems degrade to `_error` placeholders and warnings; only
    /// structural failures reject the build.
    pub fn build(&mut self, roots: Vec<SerializedComponent>) -> Result<(), CoreError> {
        let mut created = Vec::new();
        for node in roots {
            let idx = self.create_component_tree(&node, None, Vec::new(), &mut created)?;
            self.roots.push(idx);
        }
        self.finish_adding(&created)?;
        self.flush_side_effects()
    }

    /// Materialize a serialized subtree into the arena.
    ///
    /// Children are created after their parent so the ancestor chain is
    /// known up front; dependency setup and expansion run later, once the
    /// whole batch exists.
    pub(crate) fn create_component_tree(
        &mut self,
        node: &SerializedComponent,
        parent: Option<ComponentIdx>,
        ancestors: Vec<ComponentIdx>,
        created: &mut Vec<ComponentIdx>,
    ) -> Result<ComponentIdx, CoreError> {
        let type_def = match self.registry.get(&node.component_type) {
            Some(def) => def,
            None => {
                let message = format!("unknown component type `{}`", node.component_type);
                warn!(component_type = %node.component_type, "unknown component type");
                let placeholder = SerializedComponent::error_placeholder(message.clone());
                let idx = self.create_component_tree(&placeholder, parent, ancestors, created)?;
                self.warnings.push(CoreWarning::new(idx, message));
                return Ok(idx);
            }
        };

        let idx = self.components.reserve();
        let mut component = Component::new(idx, type_def.type_tag, parent, ancestors.clone());
        component.name = node.name.clone();
        component.attributes = node.attributes.clone();
        component.is_composite = type_def.is_composite;

        for template in &type_def.state {
            component
                .state
                .insert(template.name.clone(), template.instantiate());
        }

        // Seed essential storage. A list seeding an array variable explodes
        // into per-key essentials so partial freshness works from the start.
        for (var_name, value) in &node.state {
            let is_array = component
                .state_var(var_name)
                .map(|v| matches!(v.kind, crate::state::StateVarKind::Array { .. }))
                .unwrap_or(false);
            match (is_array, value) {
                (true, StateValue::List(items)) => {
                    for (i, item) in items.iter().enumerate() {
                        let key = array::ArrayKey::from_index(i);
                        component
                            .essential
                            .insert(array::essential_key(var_name, &key), item.clone());
                    }
                }
                _ => {
                    component.essential.insert(var_name.clone(), value.clone());
                }
            }
        }

        self.components.fill(idx, component)?;
        created.push(idx);

        let mut child_ancestors = Vec::with_capacity(ancestors.len() + 1);
        child_ancestors.push(idx);
        child_ancestors.extend(ancestors);
        for child_node in &node.children {
            let child =
                self.create_component_tree(child_node, Some(idx), child_ancestors.clone(), created)?;
            if let Some(component) = self.components.get_mut(idx) {
                component.defining_children.push(child);
            }
        }
        Ok(idx)
    }

    /// Finish a batch of created components: derive active children, set up
    /// dependencies, notify the resolver, and queue composite expansion.
    pub(crate) fn finish_adding(&mut self, created: &[ComponentIdx]) -> Result<(), CoreError> {
        for &idx in created {
            self.recompute_active_children(idx)?;
        }
        for &idx in created {
            self.deps
                .set_up_component_dependencies(&mut self.components, idx)?;
        }

        let nodes: Vec<ResolverNode> = created
            .iter()
            .filter_map(|&idx| self.components.get(idx))
            .map(|c| ResolverNode {
                idx: c.idx,
                component_type: c.component_type,
                name: c.name.clone(),
                parent: c.parent,
                children: c.defining_children.clone(),
                attributes: c.attributes.clone(),
            })
            .collect();
        self.resolver.add_nodes(&nodes);

        for &idx in created {
            let is_unexpanded_composite = self
                .components
                .get(idx)
                .map(|c| c.is_composite && !c.is_expanded)
                .unwrap_or(false);
            if is_unexpanded_composite {
                self.queues.replacements.insert(idx);
            }
        }
        Ok(())
    }

    /// Enqueue a two-way-binding update and drain the queue.
    pub fn request_update(
        &mut self,
        component: ComponentIdx,
        variable: impl Into<String>,
        value: impl Into<StateValue>,
        skippable: bool,
    ) -> Result<(), CoreError> {
        self.queue.enqueue(CoreRequest::UpdateValue {
            component,
            variable: variable.into(),
            value: value.into(),
            skippable,
        });
        self.drain_queue()
    }

    /// Enqueue an action invocation and drain the queue.
    pub fn perform_action(&mut self, request: ActionRequest) -> Result<(), CoreError> {
        self.queue.enqueue(CoreRequest::Action(request));
        self.drain_queue()
    }

    /// Enqueue an embedder event so it serializes with surrounding updates.
    pub fn record_event(
        &mut self,
        name: impl Into<String>,
        data: impl Into<StateValue>,
    ) -> Result<(), CoreError> {
        self.queue.enqueue(CoreRequest::RecordEvent {
            name: name.into(),
            data: data.into(),
        });
        self.drain_queue()
    }

    /// Drain the request queue, one request at a time.
    ///
    /// Re-entrant calls return immediately; the already-running drain picks
    /// up whatever they enqueued. A failed request becomes a warning and the
    /// drain continues.
    pub(crate) fn drain_queue(&mut self) -> Result<(), CoreError> {
        if !self.queue.begin_drain() {
            return Ok(());
        }
        while let Some(request) = self.queue.pop() {
            if let Err(err) = self.handle_request(request) {
                warn!(error = %err, "request failed");
                self.warnings
                    .push(CoreWarning::unlocated(format!("request failed: {err}")));
            }
        }
        self.queue.end_drain();
        Ok(())
    }

    fn handle_request(&mut self, request: CoreRequest) -> Result<(), CoreError> {
        match request {
            CoreRequest::UpdateValue {
                component,
                variable,
                value,
                ..
            } => {
                self.request_change(component, &variable, value)?;
            }
            CoreRequest::Action(action) => {
                let handler = self
                    .components
                    .get(action.component)
                    .ok_or(CoreError::ComponentNotFound(action.component))
                    .and_then(|c| {
                        self.registry
                            .get(c.component_type)
                            .and_then(|def| def.actions.get(action.action.as_str()).cloned())
                            .ok_or_else(|| {
                                CoreError::User(anyhow::anyhow!(
                                    "component {} has no action `{}`",
                                    action.component,
                                    action.action
                                ))
                            })
                    })?;
                handler(self, action.component, &action.args)?;
            }
            CoreRequest::RecordEvent { name, data } => {
                tracing::info!(event = %name, data = %data, "document event");
            }
        }
        self.flush_side_effects()
    }

    /// Execute the side-effect queues accumulated by staleness walks.
    pub(crate) fn flush_side_effects(&mut self) -> Result<(), CoreError> {
        loop {
            if self.queues.dependency_setup.is_empty()
                && self.queues.children_changed.is_empty()
                && self.queues.replacements.is_empty()
            {
                break;
            }
            let setup: Vec<ComponentIdx> =
                std::mem::take(&mut self.queues.dependency_setup).into_iter().collect();
            for idx in setup {
                if self.components.contains(idx) {
                    self.deps
                        .set_up_component_dependencies(&mut self.components, idx)?;
                }
            }

            let children: Vec<ComponentIdx> =
                std::mem::take(&mut self.queues.children_changed).into_iter().collect();
            for idx in children {
                self.refresh_children_dependents(idx)?;
            }

            if !self.queues.replacements.is_empty() {
                self.process_replacement_queue()?;
            }
        }
        Ok(())
    }

    /// Re-snapshot child-gathering edges on one component after its active
    /// child list changed, and mark the affected variables stale.
    pub(crate) fn refresh_children_dependents(
        &mut self,
        idx: ComponentIdx,
    ) -> Result<(), CoreError> {
        let changed = self.deps.refresh_child_edges(&self.components, idx);
        for ptr in changed {
            self.set_variable_stale(&ptr)?;
        }
        self.queues.renderer.insert(idx);
        Ok(())
    }

    /// Delete a set of components and everything hanging off them.
    ///
    /// Children, attribute components, replacements, and shadow components
    /// go with their owner. Surviving dependents of deleted variables are
    /// marked stale.
    pub fn delete_components(&mut self, indices: &[ComponentIdx]) -> Result<(), CoreError> {
        let mut doomed: Vec<ComponentIdx> = Vec::new();
        let mut pending: Vec<ComponentIdx> = indices.to_vec();
        while let Some(idx) = pending.pop() {
            if doomed.contains(&idx) {
                continue;
            }
            let Some(component) = self.components.get(idx) else {
                continue;
            };
            doomed.push(idx);
            pending.extend(component.defining_children.iter().copied());
            pending.extend(component.attribute_components.iter().copied());
            pending.extend(component.replacements.iter().copied());
            pending.extend(component.shadowed_by.iter().copied());
        }

        let mut survivors: Vec<VarPointer> = Vec::new();
        for &idx in &doomed {
            for ptr in self.deps.delete_all_edges(idx) {
                if !doomed.contains(&ptr.component) && !survivors.contains(&ptr) {
                    survivors.push(ptr);
                }
            }
        }

        let mut parents: BTreeSet<ComponentIdx> = BTreeSet::new();
        for &idx in &doomed {
            if let Some(removed) = self.components.remove(idx) {
                if let Some(parent) = removed.parent {
                    if !doomed.contains(&parent) {
                        parents.insert(parent);
                    }
                }
                if let Some(shadow) = removed.shadows {
                    if let Some(source) = self.components.get_mut(shadow.source) {
                        source.shadowed_by.retain(|&s| s != idx);
                    }
                }
            }
            self.roots.retain(|&r| r != idx);
            self.queues.renderer.remove(&idx);
            self.queues.renderer_children.remove(&idx);
        }
        self.resolver.delete_nodes(&doomed);

        for parent in parents {
            if let Some(component) = self.components.get_mut(parent) {
                component.defining_children.retain(|c| !doomed.contains(c));
                component.replacements.retain(|c| !doomed.contains(c));
            }
            self.recompute_active_children(parent)?;
            self.refresh_children_dependents(parent)?;
        }
        for ptr in survivors {
            if self.components.contains(ptr.component) {
                self.set_variable_stale(&ptr)?;
            }
        }
        self.flush_side_effects()
    }

    /// Drain the essential writes recorded since the last call, for
    /// embedder persistence.
    pub fn take_essential_changes(&mut self) -> IndexMap<(ComponentIdx, String), StateValue> {
        std::mem::take(&mut self.essential_changes)
    }

    /// Drain the variables whose chained actions fired.
    pub fn take_triggered_actions(&mut self) -> Vec<VarPointer> {
        std::mem::take(&mut self.queues.action_chain)
    }

    /// Drain accumulated warnings.
    pub fn take_warnings(&mut self) -> Vec<CoreWarning> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_degrades_to_error_placeholder() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("mystery")]).unwrap();
        let root = core.roots[0];
        let component = core.components.get(root).unwrap();
        assert_eq!(component.component_type, "_error");
        assert!(!core.warnings.is_empty());
        let message = core.get_value(root, "message").unwrap();
        assert_eq!(
            message,
            StateValue::Text("unknown component type `mystery`".into())
        );
    }

    #[test]
    fn test_build_seeds_essential_state() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("number")
            .with_name("a")
            .with_state("value", 7i64)])
            .unwrap();
        let root = core.roots[0];
        assert_eq!(core.get_value(root, "value").unwrap(), StateValue::Integer(7));
    }

    #[test]
    fn test_array_state_seed_explodes_into_keys() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("numberList")
            .with_attribute("count", 3i64)
            .with_state(
                "values",
                vec![
                    StateValue::Integer(1),
                    StateValue::Integer(2),
                    StateValue::Integer(3),
                ],
            )])
            .unwrap();
        let root = core.roots[0];
        let component = core.components.get(root).unwrap();
        assert_eq!(
            component.essential.get("values:1"),
            Some(&StateValue::Integer(2))
        );
        assert_eq!(
            core.get_value(root, "values").unwrap(),
            StateValue::List(vec![
                StateValue::Integer(1),
                StateValue::Integer(2),
                StateValue::Integer(3),
            ])
        );
    }
}
