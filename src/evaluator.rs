//! Lazy evaluation: freshen a variable on demand, computing only what is
//! stale along the way.

use std::collections::BTreeSet;

use crate::arena::ComponentIdx;
use crate::array::{self, ArrayKey};
use crate::definition::{DependencyValue, DependencyValues, Instruction, KeyInstruction};
use crate::deps::{ChangeSummary, DependencySource, VarPointer};
use crate::error::CoreError;
use crate::state::{Freshness, StateVarKind};
use crate::value::StateValue;

use crate::core::DocumentCore;

struct Frame {
    ptr: VarPointer,
    key: Option<ArrayKey>,
    expanded: bool,
}

impl DocumentCore {
    /// The current value of one state variable, computing whatever stale
    /// work it transitively depends on.
    ///
    /// Array-entry names (`value3`) materialize their variable on first
    /// reference.
    pub fn get_value(&mut self, idx: ComponentIdx, variable: &str) -> Result<StateValue, CoreError> {
        let ptr = VarPointer::new(idx, variable);
        self.ensure_state_variable(&ptr)?;
        self.freshen(&ptr, None)?;
        let component = self
            .components
            .get(idx)
            .ok_or(CoreError::ComponentNotFound(idx))?;
        let var = component
            .state_var(variable)
            .ok_or_else(|| CoreError::VariableNotFound {
                component: idx,
                variable: variable.to_string(),
            })?;
        Ok(var.value.clone())
    }

    /// Materialize an array-entry variable if the name denotes one and it
    /// does not exist yet.
    pub(crate) fn ensure_state_variable(&mut self, ptr: &VarPointer) -> Result<(), CoreError> {
        let component = self
            .components
            .get(ptr.component)
            .ok_or(CoreError::ComponentNotFound(ptr.component))?;
        if component.state.contains_key(&ptr.variable) {
            return Ok(());
        }

        // Match the name against the entry prefixes of the array variables.
        let mut entry = None;
        for (array_name, var) in &component.state {
            let Some(prefix) = &var.entry_prefix else {
                continue;
            };
            let Some(key) = array::entry_key_for_name(prefix, &ptr.variable) else {
                continue;
            };
            let mut new_var =
                crate::state::StateVar::entry(array_name, key, std::sync::Arc::clone(&var.definition));
            new_var.inverse = var.inverse.clone();
            new_var.default_value = var.default_value.clone();
            new_var.has_essential = var.has_essential;
            new_var.modify_indirectly = var.modify_indirectly;
            entry = Some(new_var);
            break;
        }
        let Some(entry) = entry else {
            return Err(CoreError::VariableNotFound {
                component: ptr.component,
                variable: ptr.variable.clone(),
            });
        };

        let component = self
            .components
            .get_mut(ptr.component)
            .ok_or(CoreError::ComponentNotFound(ptr.component))?;
        component.state.insert(ptr.variable.clone(), entry);
        self.deps
            .set_up_variable_dependencies(&mut self.components, ptr)?;
        Ok(())
    }

    /// Freshen one variable, or one key of an array variable.
    ///
    /// Runs an explicit work stack instead of recursing, so dependency
    /// chains are bounded by memory rather than the call stack. A revisit
    /// of a variable already being freshened is a cycle.
    pub(crate) fn freshen(
        &mut self,
        root: &VarPointer,
        key: Option<ArrayKey>,
    ) -> Result<(), CoreError> {
        let mut stack = vec![Frame {
            ptr: root.clone(),
            key,
            expanded: false,
        }];
        let mut on_path: Vec<VarPointer> = Vec::new();

        while let Some(mut frame) = stack.pop() {
            if frame.expanded {
                on_path.pop();
                self.compute_variable(&frame.ptr, frame.key.clone())?;
                continue;
            }
            if self.variable_is_fresh(&frame.ptr, frame.key.as_ref())? {
                continue;
            }
            if on_path.contains(&frame.ptr) {
                let pos = on_path.iter().position(|p| p == &frame.ptr).unwrap_or(0);
                let mut path: Vec<String> =
                    on_path[pos..].iter().map(|p| p.to_string()).collect();
                path.push(frame.ptr.to_string());
                return Err(CoreError::Cycle { path });
            }
            on_path.push(frame.ptr.clone());

            let pending = self.stale_dependencies(&frame.ptr)?;
            frame.expanded = true;
            stack.push(frame);
            for (ptr, key) in pending {
                stack.push(Frame {
                    ptr,
                    key,
                    expanded: false,
                });
            }
        }
        Ok(())
    }

    fn variable_is_fresh(
        &self,
        ptr: &VarPointer,
        key: Option<&ArrayKey>,
    ) -> Result<bool, CoreError> {
        let component = self
            .components
            .get(ptr.component)
            .ok_or(CoreError::ComponentNotFound(ptr.component))?;
        let var = component
            .state_var(&ptr.variable)
            .ok_or_else(|| CoreError::VariableNotFound {
                component: ptr.component,
                variable: ptr.variable.clone(),
            })?;
        Ok(match (&var.kind, key) {
            (StateVarKind::Array { .. }, Some(k)) => {
                var.freshness.size_fresh()
                    && (var.freshness.is_fresh_for(k)
                        || k.flat_offset(&var.array_size).is_none())
            }
            (StateVarKind::Array { .. }, None) => {
                var.freshness.size_fresh() && var.fresh_count() == var.total_keys() + 1
            }
            _ => var.freshness.is_fully_fresh(),
        })
    }

    /// Which of a variable's dependencies need freshening first.
    fn stale_dependencies(
        &mut self,
        ptr: &VarPointer,
    ) -> Result<Vec<(VarPointer, Option<ArrayKey>)>, CoreError> {
        let kind = {
            let component = self
                .components
                .get(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            component
                .state_var(&ptr.variable)
                .ok_or_else(|| CoreError::VariableNotFound {
                    component: ptr.component,
                    variable: ptr.variable.clone(),
                })?
                .kind
                .clone()
        };

        // An entry freshens exactly its key of the backing array.
        if let StateVarKind::ArrayEntry { array_name, key } = kind {
            let array_ptr = VarPointer::new(ptr.component, array_name);
            if !self.variable_is_fresh(&array_ptr, Some(&key))? {
                return Ok(vec![(array_ptr, Some(key))]);
            }
            return Ok(vec![]);
        }

        let mut pending = Vec::new();
        let edges = self.deps.edges(ptr).to_vec();
        for edge in edges {
            match edge.source {
                DependencySource::StateVar { component, var } => {
                    let source = VarPointer::new(component, var);
                    self.ensure_state_variable(&source)?;
                    if !self.variable_is_fresh(&source, None)? {
                        pending.push((source, None));
                    }
                }
                DependencySource::ChildStateVars { children, var, .. } => {
                    for child in children {
                        let source = VarPointer::new(child, var.clone());
                        if !self.variable_is_fresh(&source, None)? {
                            pending.push((source, None));
                        }
                    }
                }
                DependencySource::Essential { .. } | DependencySource::Attribute { .. } => {}
            }
        }
        Ok(pending)
    }

    /// Gather the current values of one variable's dependencies.
    pub(crate) fn gather_dependency_values(
        &self,
        ptr: &VarPointer,
    ) -> Result<DependencyValues, CoreError> {
        let mut values = DependencyValues::new();
        for edge in self.deps.edges(ptr) {
            let gathered = match &edge.source {
                DependencySource::StateVar { component, var } => {
                    let c = self
                        .components
                        .get(*component)
                        .ok_or(CoreError::ComponentNotFound(*component))?;
                    let v = c
                        .state_var(var)
                        .ok_or_else(|| CoreError::VariableNotFound {
                            component: *component,
                            variable: var.clone(),
                        })?;
                    DependencyValue {
                        value: v.value.clone(),
                        changed: edge.changed,
                        changed_keys: edge.changed_keys.clone(),
                        used_default: v.used_default,
                    }
                }
                DependencySource::ChildStateVars { children, var, .. } => {
                    let mut items = Vec::with_capacity(children.len());
                    for &child in children {
                        let c = self
                            .components
                            .get(child)
                            .ok_or(CoreError::ComponentNotFound(child))?;
                        let v = c
                            .state_var(var)
                            .ok_or_else(|| CoreError::VariableNotFound {
                                component: child,
                                variable: var.clone(),
                            })?;
                        items.push(v.value.clone());
                    }
                    DependencyValue {
                        value: StateValue::List(items),
                        changed: edge.changed,
                        changed_keys: edge.changed_keys.clone(),
                        used_default: false,
                    }
                }
                DependencySource::Attribute {
                    component,
                    name,
                    default,
                } => {
                    let c = self
                        .components
                        .get(*component)
                        .ok_or(CoreError::ComponentNotFound(*component))?;
                    match c.attribute(name) {
                        Some(value) => DependencyValue {
                            value: value.clone(),
                            changed: edge.changed,
                            changed_keys: BTreeSet::new(),
                            used_default: false,
                        },
                        None => DependencyValue {
                            value: default.clone(),
                            changed: edge.changed,
                            changed_keys: BTreeSet::new(),
                            used_default: true,
                        },
                    }
                }
                DependencySource::Essential { component, key } => {
                    let c = self
                        .components
                        .get(*component)
                        .ok_or(CoreError::ComponentNotFound(*component))?;
                    DependencyValue {
                        value: c.essential.get(key).cloned().unwrap_or(StateValue::Null),
                        changed: edge.changed,
                        changed_keys: BTreeSet::new(),
                        used_default: false,
                    }
                }
            };
            values.insert(edge.name.clone(), gathered);
        }
        Ok(values)
    }

    /// Recompute one variable against its already-fresh dependencies.
    pub(crate) fn compute_variable(
        &mut self,
        ptr: &VarPointer,
        key: Option<ArrayKey>,
    ) -> Result<(), CoreError> {
        if self.variable_is_fresh(ptr, key.as_ref())? {
            return Ok(());
        }
        let kind = {
            let component = self
                .components
                .get(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            component
                .state_var(&ptr.variable)
                .ok_or_else(|| CoreError::VariableNotFound {
                    component: ptr.component,
                    variable: ptr.variable.clone(),
                })?
                .kind
                .clone()
        };
        match kind {
            StateVarKind::ArrayEntry { array_name, key } => {
                self.compute_entry(ptr, &array_name, &key)
            }
            StateVarKind::Array { .. } => self.compute_array(ptr, key),
            StateVarKind::Scalar => self.compute_scalar(ptr),
        }
    }

    fn compute_entry(
        &mut self,
        ptr: &VarPointer,
        array_name: &str,
        key: &ArrayKey,
    ) -> Result<(), CoreError> {
        let new_value = {
            let component = self
                .components
                .get(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            let array = component
                .state_var(array_name)
                .ok_or_else(|| CoreError::VariableNotFound {
                    component: ptr.component,
                    variable: array_name.to_string(),
                })?;
            key.flat_offset(&array.array_size)
                .and_then(|offset| array.value.as_list().and_then(|items| items.get(offset)))
                .cloned()
                .unwrap_or(StateValue::Null)
        };

        let changed = {
            let component = self
                .components
                .get_mut(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            let Some(var) = component.state_var_mut(&ptr.variable) else {
                return Err(CoreError::VariableNotFound {
                    component: ptr.component,
                    variable: ptr.variable.clone(),
                });
            };
            let old = var.previous_value.take().unwrap_or_else(|| var.value.clone());
            var.value = new_value.clone();
            var.freshness = Freshness::Fresh;
            new_value != old
        };
        if changed {
            self.deps.record_actual_change(ptr, &ChangeSummary::whole());
        }
        self.deps.consume_changes(ptr);
        Ok(())
    }

    fn compute_scalar(&mut self, ptr: &VarPointer) -> Result<(), CoreError> {
        let definition = {
            let component = self
                .components
                .get(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            std::sync::Arc::clone(
                &component
                    .state_var(&ptr.variable)
                    .ok_or_else(|| CoreError::VariableNotFound {
                        component: ptr.component,
                        variable: ptr.variable.clone(),
                    })?
                    .definition,
            )
        };
        let values = self.gather_dependency_values(ptr)?;
        let result = (definition.calculate)(&values).map_err(CoreError::User)?;
        self.warnings.extend(result.warnings);

        for produced in &definition.produces {
            let Some(instruction) = result.instructions.get(produced) else {
                return Err(CoreError::DefinitionContract {
                    pointer: ptr.clone(),
                    message: format!("no instruction for produced variable `{produced}`"),
                });
            };
            self.apply_instruction(ptr, produced, instruction)?;
        }
        self.deps.consume_changes(ptr);
        Ok(())
    }

    fn apply_instruction(
        &mut self,
        origin: &VarPointer,
        variable: &str,
        instruction: &Instruction,
    ) -> Result<(), CoreError> {
        let idx = origin.component;
        let (essential_value, default, essential_key, write_allowed, for_renderer) = {
            let component = self
                .components
                .get(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            let var = component
                .state_var(variable)
                .ok_or_else(|| CoreError::DefinitionContract {
                    pointer: origin.clone(),
                    message: format!("instruction names nonexistent variable `{variable}`"),
                })?;
            (
                component.essential.get(&var.essential_key).cloned(),
                var.default_value.clone(),
                var.essential_key.clone(),
                var.essential_write_allowed,
                var.for_renderer,
            )
        };

        let mut essential_write = None;
        let (new_value, used_default, keep_old) = match instruction {
            Instruction::SetValue(value) => (value.clone(), false, false),
            Instruction::UseEssentialOrDefault { fallback } => match essential_value {
                Some(value) => (value, false, false),
                None => match fallback {
                    Some(value) if !value.is_null() => (value.clone(), false, false),
                    _ => (default, true, false),
                },
            },
            Instruction::SetEssential(value) => {
                if !write_allowed {
                    return Err(CoreError::DefinitionContract {
                        pointer: origin.clone(),
                        message: format!(
                            "essential write to `{variable}` is not allowed here"
                        ),
                    });
                }
                essential_write = Some(value.clone());
                (value.clone(), false, false)
            }
            Instruction::MarkAsUsedDefault => (default, true, false),
            Instruction::NoChanges => (StateValue::Null, false, true),
            Instruction::ArraySizeChanged(_) => {
                return Err(CoreError::DefinitionContract {
                    pointer: origin.clone(),
                    message: format!("array instruction applied to scalar `{variable}`"),
                });
            }
        };

        if let Some(value) = essential_write {
            let origin_ptr = VarPointer::new(idx, variable);
            self.write_essential_storage(idx, &essential_key, value, Some(&origin_ptr))?;
        }

        let ptr = VarPointer::new(idx, variable);
        let changed = {
            let component = self
                .components
                .get_mut(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            let Some(var) = component.state_var_mut(variable) else {
                return Err(CoreError::VariableNotFound {
                    component: idx,
                    variable: variable.to_string(),
                });
            };
            let old = var.previous_value.take().unwrap_or_else(|| var.value.clone());
            if !keep_old {
                var.value = new_value;
                var.used_default = used_default;
            }
            var.freshness = Freshness::Fresh;
            !keep_old && var.value != old
        };
        if changed {
            self.deps.record_actual_change(&ptr, &ChangeSummary::whole());
            if for_renderer {
                self.queues.renderer.insert(idx);
            }
        }
        Ok(())
    }

    fn compute_array(&mut self, ptr: &VarPointer, want_key: Option<ArrayKey>) -> Result<(), CoreError> {
        let definition = {
            let component = self
                .components
                .get(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            std::sync::Arc::clone(
                &component
                    .state_var(&ptr.variable)
                    .ok_or_else(|| CoreError::VariableNotFound {
                        component: ptr.component,
                        variable: ptr.variable.clone(),
                    })?
                    .definition,
            )
        };
        let Some(behavior) = definition.array.clone() else {
            return Err(CoreError::DefinitionContract {
                pointer: ptr.clone(),
                message: "array variable has no array behavior".to_string(),
            });
        };
        let values = self.gather_dependency_values(ptr)?;

        // Size first: key validity and storage layout depend on it.
        let mut size_changed = false;
        {
            let size_fresh = {
                let component = self
                    .components
                    .get(ptr.component)
                    .ok_or(CoreError::ComponentNotFound(ptr.component))?;
                component
                    .state_var(&ptr.variable)
                    .map(|v| v.freshness.size_fresh())
                    .unwrap_or(false)
            };
            if !size_fresh {
                // A definition may declare the size itself through an
                // `ArraySizeChanged` instruction; otherwise the array
                // behavior's size function decides.
                let declared = {
                    let result = (definition.calculate)(&values).map_err(CoreError::User)?;
                    self.warnings.extend(result.warnings);
                    match result.instructions.get(&ptr.variable) {
                        Some(Instruction::ArraySizeChanged(size)) => Some(size.clone()),
                        _ => None,
                    }
                };
                let new_size = match declared {
                    Some(size) => size,
                    None => (behavior.size)(&values).map_err(CoreError::User)?,
                };
                let component = self
                    .components
                    .get_mut(ptr.component)
                    .ok_or(CoreError::ComponentNotFound(ptr.component))?;
                if let Some(var) = component.state_var_mut(&ptr.variable) {
                    if new_size != var.array_size {
                        size_changed = true;
                        var.array_size = new_size;
                        let total = array::total_keys(&var.array_size);
                        let default = var.default_value.clone();
                        match &mut var.value {
                            StateValue::List(items) => {
                                items.resize(total, default);
                            }
                            other => {
                                *other = StateValue::List(vec![default; total]);
                            }
                        }
                        // A resize shifts flat offsets, so no key survives.
                        var.freshness = Freshness::Partial {
                            fresh_keys: BTreeSet::new(),
                            size_fresh: true,
                        };
                        var.previous_value = None;
                    } else {
                        var.freshness = match std::mem::replace(&mut var.freshness, Freshness::Stale)
                        {
                            Freshness::Partial { fresh_keys, .. } => Freshness::Partial {
                                fresh_keys,
                                size_fresh: true,
                            },
                            Freshness::Fresh => Freshness::Fresh,
                            Freshness::Stale => Freshness::Partial {
                                fresh_keys: BTreeSet::new(),
                                size_fresh: true,
                            },
                        };
                    }
                }
            }
        }

        // Which keys to compute this pass.
        let (stale_keys, array_size, essential_defaults) = {
            let component = self
                .components
                .get(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            let var = component
                .state_var(&ptr.variable)
                .ok_or_else(|| CoreError::VariableNotFound {
                    component: ptr.component,
                    variable: ptr.variable.clone(),
                })?;
            let all = array::all_array_keys(&var.array_size);
            let stale: Vec<ArrayKey> = match &want_key {
                Some(k) => {
                    if k.flat_offset(&var.array_size).is_some() && !var.freshness.is_fresh_for(k) {
                        vec![k.clone()]
                    } else {
                        vec![]
                    }
                }
                None => all
                    .iter()
                    .filter(|k| !var.freshness.is_fresh_for(k))
                    .cloned()
                    .collect(),
            };
            let defaults: Vec<(ArrayKey, Option<StateValue>)> = stale
                .iter()
                .map(|k| {
                    (
                        k.clone(),
                        component
                            .essential
                            .get(&array::essential_key(&ptr.variable, k))
                            .cloned(),
                    )
                })
                .collect();
            (stale, var.array_size.clone(), defaults)
        };

        let mut changed_keys: BTreeSet<ArrayKey> = BTreeSet::new();
        if !stale_keys.is_empty() {
            let computed =
                (behavior.calculate_keys)(&stale_keys, &values).map_err(CoreError::User)?;
            let component = self
                .components
                .get_mut(ptr.component)
                .ok_or(CoreError::ComponentNotFound(ptr.component))?;
            let Some(var) = component.state_var_mut(&ptr.variable) else {
                return Err(CoreError::VariableNotFound {
                    component: ptr.component,
                    variable: ptr.variable.clone(),
                });
            };
            let default = var.default_value.clone();
            for (key, essential) in &essential_defaults {
                let Some(instruction) = computed.get(key) else {
                    return Err(CoreError::DefinitionContract {
                        pointer: ptr.clone(),
                        message: format!("no instruction for array key `{key}`"),
                    });
                };
                let Some(offset) = key.flat_offset(&array_size) else {
                    continue;
                };
                let new_value = match instruction {
                    KeyInstruction::SetValue(value) => Some(value.clone()),
                    KeyInstruction::UseEssentialOrDefault => {
                        Some(essential.clone().unwrap_or_else(|| default.clone()))
                    }
                    KeyInstruction::NoChange => None,
                };
                if let StateValue::List(items) = &mut var.value {
                    if let (Some(new_value), Some(slot)) = (new_value, items.get_mut(offset)) {
                        if *slot != new_value {
                            *slot = new_value;
                            changed_keys.insert(key.clone());
                        }
                    }
                }
                match &mut var.freshness {
                    Freshness::Partial { fresh_keys, .. } => {
                        fresh_keys.insert(key.clone());
                    }
                    Freshness::Stale => {
                        let mut fresh_keys = BTreeSet::new();
                        fresh_keys.insert(key.clone());
                        var.freshness = Freshness::Partial {
                            fresh_keys,
                            size_fresh: true,
                        };
                    }
                    Freshness::Fresh => {}
                }
            }
            let total = array::total_keys(&var.array_size);
            if total > 0 {
                if let Freshness::Partial {
                    fresh_keys,
                    size_fresh: true,
                } = &var.freshness
                {
                    if fresh_keys.len() == total {
                        var.freshness = Freshness::Fresh;
                    }
                }
            }
            var.previous_value = None;
        }

        if size_changed || !changed_keys.is_empty() {
            let summary = ChangeSummary::keys(changed_keys, size_changed);
            self.deps.record_actual_change(ptr, &summary);
            let for_renderer = self
                .components
                .get(ptr.component)
                .and_then(|c| c.state_var(&ptr.variable))
                .map(|v| v.for_renderer)
                .unwrap_or(false);
            if for_renderer {
                self.queues.renderer.insert(ptr.component);
            }
        }
        if want_key.is_none() {
            self.deps.consume_changes(ptr);
        }
        Ok(())
    }
}
