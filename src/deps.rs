//! The dependency graph: resolved edges between state variables.
//!
//! Terminology follows the data-flow direction of a computation: a
//! variable's *downstream* edges are the things its definition reads, and
//! its *upstream* dependents are the variables that read it. Staleness
//! walks upstream; evaluation walks downstream.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::arena::{ComponentIdx, ComponentTable};
use crate::array::ArrayKey;
use crate::definition::{DepTarget, DependencySpec};
use crate::error::CoreError;
use crate::state::StateVarKind;
use crate::value::StateValue;

/// Address of one state variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VarPointer {
    /// The owning component.
    pub component: ComponentIdx,
    /// The variable name.
    pub variable: String,
}

impl VarPointer {
    /// Build a pointer.
    pub fn new(component: ComponentIdx, variable: impl Into<String>) -> Self {
        Self {
            component,
            variable: variable.into(),
        }
    }
}

impl fmt::Display for VarPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.variable)
    }
}

/// A resolved dependency source.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencySource {
    /// Another state variable.
    StateVar {
        /// The source component.
        component: ComponentIdx,
        /// The source variable.
        var: String,
    },
    /// Essential storage on a component.
    Essential {
        /// The owning component.
        component: ComponentIdx,
        /// Key into the essential map.
        key: String,
    },
    /// One variable gathered across a snapshot of active children.
    ChildStateVars {
        /// The parent whose children are gathered.
        parent: ComponentIdx,
        /// The gathered variable.
        var: String,
        /// The children carrying the variable, snapshotted at setup time.
        children: Vec<ComponentIdx>,
    },
    /// A literal authored attribute. Attributes never change after build, so
    /// these edges never carry change flags.
    Attribute {
        /// The owning component.
        component: ComponentIdx,
        /// Attribute name.
        name: String,
        /// Value when the attribute is absent.
        default: StateValue,
    },
}

/// One downstream edge of a variable, carrying accumulated change flags
/// that are consumed by the next recomputation.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyEdge {
    /// The name the definition declared for this dependency.
    pub name: String,
    /// Where the value comes from.
    pub source: DependencySource,
    /// True when the source changed since the owner last computed.
    pub changed: bool,
    /// Which keys changed, for array sources, when known.
    pub changed_keys: BTreeSet<ArrayKey>,
    /// True when the source's array size changed.
    pub size_changed: bool,
}

impl DependencyEdge {
    fn new(name: String, source: DependencySource) -> Self {
        Self {
            name,
            source,
            // New edges start changed so the first computation sees every
            // dependency as new.
            changed: true,
            changed_keys: BTreeSet::new(),
            size_changed: false,
        }
    }
}

/// What changed about a variable, passed along the staleness walk.
#[derive(Debug, Clone, Default)]
pub struct ChangeSummary {
    /// True for a whole-value change.
    pub whole: bool,
    /// Changed keys, for array variables.
    pub keys: BTreeSet<ArrayKey>,
    /// True when the array size changed.
    pub size_changed: bool,
}

impl ChangeSummary {
    /// A whole-value change.
    pub fn whole() -> Self {
        Self {
            whole: true,
            ..Default::default()
        }
    }

    /// A by-key change.
    pub fn keys(keys: BTreeSet<ArrayKey>, size_changed: bool) -> Self {
        Self {
            whole: false,
            keys,
            size_changed,
        }
    }

    /// A single-key change.
    pub fn single_key(key: ArrayKey) -> Self {
        let mut keys = BTreeSet::new();
        keys.insert(key);
        Self::keys(keys, false)
    }
}

/// The document-wide dependency graph.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Downstream edges per variable, in declaration order.
    downstream: HashMap<VarPointer, Vec<DependencyEdge>>,
    /// Dependents per variable.
    upstream: HashMap<VarPointer, Vec<VarPointer>>,
    /// Dependents per essential-storage key.
    essential_upstream: HashMap<(ComponentIdx, String), Vec<VarPointer>>,
}

impl DependencyGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every declared dependency of every state variable on one
    /// component into concrete edges, and mark the variables resolved.
    ///
    /// Runs once per component at build or expansion time, and again for
    /// individual variables when a deferred dependency-recalculation side
    /// effect fires.
    pub fn set_up_component_dependencies(
        &mut self,
        components: &mut ComponentTable,
        idx: ComponentIdx,
    ) -> Result<Vec<VarPointer>, CoreError> {
        let var_names: Vec<String> = components
            .get(idx)
            .ok_or(CoreError::ComponentNotFound(idx))?
            .state
            .keys()
            .cloned()
            .collect();

        let mut pointers = Vec::with_capacity(var_names.len());
        for name in var_names {
            let ptr = VarPointer::new(idx, name);
            self.set_up_variable_dependencies(components, &ptr)?;
            pointers.push(ptr);
        }
        Ok(pointers)
    }

    /// Resolve one variable's declared dependencies.
    pub fn set_up_variable_dependencies(
        &mut self,
        components: &mut ComponentTable,
        ptr: &VarPointer,
    ) -> Result<(), CoreError> {
        let component = components
            .get(ptr.component)
            .ok_or(CoreError::ComponentNotFound(ptr.component))?;
        let var = component
            .state_var(&ptr.variable)
            .ok_or_else(|| CoreError::VariableNotFound {
                component: ptr.component,
                variable: ptr.variable.clone(),
            })?;

        let mut edges = Vec::with_capacity(var.definition.dependencies.len());
        for (name, spec) in var.definition.dependencies.clone() {
            let source = self.resolve_spec(components, ptr, &spec)?;
            edges.push(DependencyEdge::new(name, source));
        }

        // Entry variables additionally read their backing array key, so a
        // change to that key reaches them without the entry declaring it.
        if let StateVarKind::ArrayEntry { array_name, key } = &var.kind {
            let mut edge = DependencyEdge::new(
                "array".to_string(),
                DependencySource::StateVar {
                    component: ptr.component,
                    var: array_name.clone(),
                },
            );
            edge.changed_keys.insert(key.clone());
            edges.push(edge);
        }

        self.remove_edges(ptr);
        for edge in &edges {
            self.index_edge(ptr, &edge.source);
        }
        self.downstream.insert(ptr.clone(), edges);

        self.check_for_circular_dependency(ptr)?;

        let component = components
            .get_mut(ptr.component)
            .ok_or(CoreError::ComponentNotFound(ptr.component))?;
        if let Some(var) = component.state_var_mut(&ptr.variable) {
            var.resolved = true;
        }
        Ok(())
    }

    fn resolve_spec(
        &self,
        components: &ComponentTable,
        owner: &VarPointer,
        spec: &DependencySpec,
    ) -> Result<DependencySource, CoreError> {
        let component = components
            .get(owner.component)
            .ok_or(CoreError::ComponentNotFound(owner.component))?;
        match spec {
            DependencySpec::StateVar { target, var } => {
                let source_idx = match target {
                    DepTarget::SelfComponent => owner.component,
                    DepTarget::Parent => component.parent.ok_or_else(|| {
                        CoreError::ResolutionFailed {
                            pointer: owner.clone(),
                        }
                    })?,
                    DepTarget::ShadowSource => component
                        .shadows
                        .as_ref()
                        .map(|s| s.source)
                        .ok_or_else(|| CoreError::ResolutionFailed {
                            pointer: owner.clone(),
                        })?,
                    DepTarget::Component(idx) => *idx,
                };
                if !components.contains(source_idx) {
                    return Err(CoreError::ComponentNotFound(source_idx));
                }
                Ok(DependencySource::StateVar {
                    component: source_idx,
                    var: var.clone(),
                })
            }
            DependencySpec::ChildStateVars { var } => {
                let children: Vec<ComponentIdx> = component
                    .active_children
                    .iter()
                    .copied()
                    .filter(|&child| {
                        components
                            .get(child)
                            .map(|c| c.state.contains_key(var))
                            .unwrap_or(false)
                    })
                    .collect();
                Ok(DependencySource::ChildStateVars {
                    parent: owner.component,
                    var: var.clone(),
                    children,
                })
            }
            DependencySpec::Attribute { name, default } => Ok(DependencySource::Attribute {
                component: owner.component,
                name: name.clone(),
                default: default.clone(),
            }),
            DependencySpec::Essential { key } => Ok(DependencySource::Essential {
                component: owner.component,
                key: key.clone(),
            }),
        }
    }

    fn index_edge(&mut self, owner: &VarPointer, source: &DependencySource) {
        match source {
            DependencySource::StateVar { component, var } => {
                let key = VarPointer::new(*component, var.clone());
                let dependents = self.upstream.entry(key).or_default();
                if !dependents.contains(owner) {
                    dependents.push(owner.clone());
                }
            }
            DependencySource::ChildStateVars { var, children, .. } => {
                for &child in children {
                    let key = VarPointer::new(child, var.clone());
                    let dependents = self.upstream.entry(key).or_default();
                    if !dependents.contains(owner) {
                        dependents.push(owner.clone());
                    }
                }
            }
            DependencySource::Essential { component, key } => {
                let dependents = self
                    .essential_upstream
                    .entry((*component, key.clone()))
                    .or_default();
                if !dependents.contains(owner) {
                    dependents.push(owner.clone());
                }
            }
            DependencySource::Attribute { .. } => {}
        }
    }

    fn remove_edges(&mut self, ptr: &VarPointer) {
        let Some(edges) = self.downstream.remove(ptr) else {
            return;
        };
        for edge in edges {
            match edge.source {
                DependencySource::StateVar { component, var } => {
                    if let Some(deps) = self.upstream.get_mut(&VarPointer::new(component, var)) {
                        deps.retain(|d| d != ptr);
                    }
                }
                DependencySource::ChildStateVars { var, children, .. } => {
                    for child in children {
                        if let Some(deps) =
                            self.upstream.get_mut(&VarPointer::new(child, var.clone()))
                        {
                            deps.retain(|d| d != ptr);
                        }
                    }
                }
                DependencySource::Essential { component, key } => {
                    if let Some(deps) = self.essential_upstream.get_mut(&(component, key)) {
                        deps.retain(|d| d != ptr);
                    }
                }
                DependencySource::Attribute { .. } => {}
            }
        }
    }

    /// Downstream edges of one variable.
    pub fn edges(&self, ptr: &VarPointer) -> &[DependencyEdge] {
        self.downstream.get(ptr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dependents of one variable.
    pub fn dependents(&self, ptr: &VarPointer) -> &[VarPointer] {
        self.upstream.get(ptr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Variables reading one essential-storage key.
    pub fn essential_readers(&self, component: ComponentIdx, key: &str) -> &[VarPointer] {
        self.essential_upstream
            .get(&(component, key.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Record that a variable's value actually changed, flagging the
    /// matching edge on every dependent so the next recomputation sees it.
    pub fn record_actual_change(&mut self, ptr: &VarPointer, summary: &ChangeSummary) {
        let dependents: Vec<VarPointer> = self.dependents(ptr).to_vec();
        for dependent in dependents {
            if let Some(edges) = self.downstream.get_mut(&dependent) {
                for edge in edges.iter_mut() {
                    if edge_reads(&edge.source, ptr) {
                        edge.changed = true;
                        if summary.whole {
                            edge.changed_keys.clear();
                        } else {
                            edge.changed_keys.extend(summary.keys.iter().cloned());
                        }
                        edge.size_changed |= summary.size_changed;
                    }
                }
            }
        }
    }

    /// Names of one dependent's edges that read the given variable.
    pub fn edge_names_reading(&self, dependent: &VarPointer, source: &VarPointer) -> Vec<String> {
        self.edges(dependent)
            .iter()
            .filter(|edge| edge_reads(&edge.source, source))
            .map(|edge| edge.name.clone())
            .collect()
    }

    /// Record an essential-storage write for the variables reading it.
    pub fn record_essential_change(&mut self, component: ComponentIdx, key: &str) {
        let readers: Vec<VarPointer> = self.essential_readers(component, key).to_vec();
        for reader in readers {
            if let Some(edges) = self.downstream.get_mut(&reader) {
                for edge in edges.iter_mut() {
                    if matches!(
                        &edge.source,
                        DependencySource::Essential { component: c, key: k }
                            if *c == component && k == key
                    ) {
                        edge.changed = true;
                    }
                }
            }
        }
    }

    /// Clear the change flags on one variable's downstream edges after it
    /// recomputed against them.
    pub fn consume_changes(&mut self, ptr: &VarPointer) {
        if let Some(edges) = self.downstream.get_mut(ptr) {
            for edge in edges.iter_mut() {
                edge.changed = false;
                edge.changed_keys.clear();
                edge.size_changed = false;
            }
        }
    }

    /// Re-snapshot the child lists of every `ChildStateVars` edge owned by
    /// one component's variables, returning the pointers whose snapshots
    /// changed. Callers mark those stale.
    pub fn refresh_child_edges(
        &mut self,
        components: &ComponentTable,
        parent: ComponentIdx,
    ) -> Vec<VarPointer> {
        let Some(component) = components.get(parent) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for name in component.state.keys() {
            let ptr = VarPointer::new(parent, name.clone());
            let Some(edges) = self.downstream.get(&ptr) else {
                continue;
            };
            let mut updates: Vec<(usize, Vec<ComponentIdx>)> = Vec::new();
            for (pos, edge) in edges.iter().enumerate() {
                if let DependencySource::ChildStateVars { var, children, .. } = &edge.source {
                    let fresh: Vec<ComponentIdx> = component
                        .active_children
                        .iter()
                        .copied()
                        .filter(|&child| {
                            components
                                .get(child)
                                .map(|c| c.state.contains_key(var))
                                .unwrap_or(false)
                        })
                        .collect();
                    if fresh != *children {
                        updates.push((pos, fresh));
                    }
                }
            }
            if updates.is_empty() {
                continue;
            }
            for (pos, fresh) in updates {
                let Some(edges) = self.downstream.get_mut(&ptr) else {
                    continue;
                };
                let edge = &mut edges[pos];
                if let DependencySource::ChildStateVars { var, children, .. } = &mut edge.source {
                    let var = var.clone();
                    let old = std::mem::replace(children, fresh.clone());
                    edge.changed = true;
                    for child in old {
                        if !fresh.contains(&child) {
                            if let Some(deps) =
                                self.upstream.get_mut(&VarPointer::new(child, var.clone()))
                            {
                                deps.retain(|d| d != &ptr);
                            }
                        }
                    }
                    for child in fresh {
                        let key = VarPointer::new(child, var.clone());
                        let deps = self.upstream.entry(key).or_default();
                        if !deps.contains(&ptr) {
                            deps.push(ptr.clone());
                        }
                    }
                }
            }
            changed.push(ptr);
        }
        changed
    }

    /// Drop every edge owned by or pointing at a deleted component's
    /// variables, returning the surviving dependents that read it.
    pub fn delete_all_edges(&mut self, idx: ComponentIdx) -> Vec<VarPointer> {
        let owned: Vec<VarPointer> = self
            .downstream
            .keys()
            .filter(|p| p.component == idx)
            .cloned()
            .collect();
        for ptr in &owned {
            self.remove_edges(ptr);
        }

        let mut survivors = Vec::new();
        let pointed: Vec<VarPointer> = self
            .upstream
            .keys()
            .filter(|p| p.component == idx)
            .cloned()
            .collect();
        for ptr in pointed {
            if let Some(dependents) = self.upstream.remove(&ptr) {
                for dependent in dependents {
                    if dependent.component != idx && !survivors.contains(&dependent) {
                        survivors.push(dependent);
                    }
                }
            }
        }
        let essential_keys: Vec<(ComponentIdx, String)> = self
            .essential_upstream
            .keys()
            .filter(|(c, _)| *c == idx)
            .cloned()
            .collect();
        for key in essential_keys {
            self.essential_upstream.remove(&key);
        }
        survivors
    }

    /// Detect a dependency cycle reachable from one variable.
    ///
    /// Walks downstream state-variable edges depth first; a revisit of a
    /// variable on the current path is a cycle.
    pub fn check_for_circular_dependency(&self, start: &VarPointer) -> Result<(), CoreError> {
        let mut on_path: Vec<VarPointer> = Vec::new();
        let mut done: HashSet<VarPointer> = HashSet::new();
        self.cycle_walk(start, &mut on_path, &mut done)
    }

    fn cycle_walk(
        &self,
        ptr: &VarPointer,
        on_path: &mut Vec<VarPointer>,
        done: &mut HashSet<VarPointer>,
    ) -> Result<(), CoreError> {
        if done.contains(ptr) {
            return Ok(());
        }
        if let Some(pos) = on_path.iter().position(|p| p == ptr) {
            let mut path: Vec<String> = on_path[pos..].iter().map(|p| p.to_string()).collect();
            path.push(ptr.to_string());
            return Err(CoreError::Cycle { path });
        }
        on_path.push(ptr.clone());
        for edge in self.edges(ptr) {
            match &edge.source {
                DependencySource::StateVar { component, var } => {
                    let next = VarPointer::new(*component, var.clone());
                    self.cycle_walk(&next, on_path, done)?;
                }
                DependencySource::ChildStateVars { var, children, .. } => {
                    for &child in children {
                        let next = VarPointer::new(child, var.clone());
                        self.cycle_walk(&next, on_path, done)?;
                    }
                }
                _ => {}
            }
        }
        on_path.pop();
        done.insert(ptr.clone());
        Ok(())
    }
}

fn edge_reads(source: &DependencySource, ptr: &VarPointer) -> bool {
    match source {
        DependencySource::StateVar { component, var } => {
            *component == ptr.component && *var == ptr.variable
        }
        DependencySource::ChildStateVars { var, children, .. } => {
            *var == ptr.variable && children.contains(&ptr.component)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::component::Component;
    use crate::definition::{DefinitionResult, StateVarDefinition};
    use crate::state::StateVar;

    fn var_with_deps(name: &str, deps: Vec<(String, DependencySpec)>) -> StateVar {
        StateVar::scalar(
            name,
            Arc::new(StateVarDefinition {
                dependencies: deps,
                calculate: Arc::new(|_| Ok(DefinitionResult::new())),
                array: None,
                produces: vec![name.to_string()],
                mark_stale: None,
            }),
        )
    }

    fn build_pair() -> (ComponentTable, DependencyGraph) {
        let mut table = ComponentTable::new();
        let a = table.insert(|idx| {
            let mut c = Component::new(idx, "number", None, vec![]);
            c.state
                .insert("value".into(), var_with_deps("value", vec![]));
            c
        });
        table.insert(|idx| {
            let mut c = Component::new(idx, "number", None, vec![]);
            c.state.insert(
                "value".into(),
                var_with_deps(
                    "value",
                    vec![(
                        "source".into(),
                        DependencySpec::StateVar {
                            target: DepTarget::Component(a),
                            var: "value".into(),
                        },
                    )],
                ),
            );
            c
        });
        (table, DependencyGraph::new())
    }

    #[test]
    fn test_setup_builds_upstream_links() {
        let (mut table, mut graph) = build_pair();
        graph
            .set_up_component_dependencies(&mut table, ComponentIdx(0))
            .unwrap();
        graph
            .set_up_component_dependencies(&mut table, ComponentIdx(1))
            .unwrap();

        let a_value = VarPointer::new(ComponentIdx(0), "value");
        let b_value = VarPointer::new(ComponentIdx(1), "value");
        assert_eq!(graph.dependents(&a_value), &[b_value.clone()]);
        assert_eq!(graph.edges(&b_value).len(), 1);
        assert!(graph.edges(&b_value)[0].changed);
    }

    #[test]
    fn test_record_and_consume_changes() {
        let (mut table, mut graph) = build_pair();
        graph
            .set_up_component_dependencies(&mut table, ComponentIdx(0))
            .unwrap();
        graph
            .set_up_component_dependencies(&mut table, ComponentIdx(1))
            .unwrap();

        let a_value = VarPointer::new(ComponentIdx(0), "value");
        let b_value = VarPointer::new(ComponentIdx(1), "value");
        graph.consume_changes(&b_value);
        assert!(!graph.edges(&b_value)[0].changed);

        graph.record_actual_change(&a_value, &ChangeSummary::whole());
        assert!(graph.edges(&b_value)[0].changed);
    }

    #[test]
    fn test_circular_dependency_detected() {
        let mut table = ComponentTable::new();
        let a = table.reserve();
        let b = table.reserve();
        table
            .fill(a, {
                let mut c = Component::new(a, "number", None, vec![]);
                c.state.insert(
                    "value".into(),
                    var_with_deps(
                        "value",
                        vec![(
                            "other".into(),
                            DependencySpec::StateVar {
                                target: DepTarget::Component(b),
                                var: "value".into(),
                            },
                        )],
                    ),
                );
                c
            })
            .unwrap();
        table
            .fill(b, {
                let mut c = Component::new(b, "number", None, vec![]);
                c.state.insert(
                    "value".into(),
                    var_with_deps(
                        "value",
                        vec![(
                            "other".into(),
                            DependencySpec::StateVar {
                                target: DepTarget::Component(a),
                                var: "value".into(),
                            },
                        )],
                    ),
                );
                c
            })
            .unwrap();

        let mut graph = DependencyGraph::new();
        graph.set_up_component_dependencies(&mut table, a).unwrap();
        let err = graph.set_up_component_dependencies(&mut table, b);
        assert!(matches!(err, Err(CoreError::Cycle { .. })));
    }

    #[test]
    fn test_delete_all_edges_returns_survivors() {
        let (mut table, mut graph) = build_pair();
        graph
            .set_up_component_dependencies(&mut table, ComponentIdx(0))
            .unwrap();
        graph
            .set_up_component_dependencies(&mut table, ComponentIdx(1))
            .unwrap();

        let survivors = graph.delete_all_edges(ComponentIdx(0));
        assert_eq!(
            survivors,
            vec![VarPointer::new(ComponentIdx(1), "value")]
        );
        let a_value = VarPointer::new(ComponentIdx(0), "value");
        assert!(graph.dependents(&a_value).is_empty());
        assert!(graph.edges(&a_value).is_empty());
    }
}
