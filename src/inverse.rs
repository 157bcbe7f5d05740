//! Inverse propagation: two-way binding from a desired value back through
//! the dependency graph to essential storage.

use tracing::debug;

use crate::arena::ComponentIdx;
use crate::array::{self, ArrayKey};
use crate::definition::{DesiredValue, InverseContext, InverseInstruction};
use crate::deps::{ChangeSummary, DependencySource, VarPointer};
use crate::error::{CoreError, CoreWarning};
use crate::state::StateVarKind;
use crate::value::StateValue;

use crate::core::DocumentCore;

/// A run of inverse instructions after coalescing.
enum Coalesced {
    Essential { key: String, value: StateValue },
    Dependency { name: String, desired: DesiredValue },
}

impl DocumentCore {
    /// Drive one variable toward a desired value.
    ///
    /// A variable without an inverse definition ignores the request
    /// silently. Guarded variables (`fixed`, position-encoding, or blocked
    /// for indirect modification) reject with a warning.
    pub fn request_change(
        &mut self,
        idx: ComponentIdx,
        variable: &str,
        value: impl Into<StateValue>,
    ) -> Result<(), CoreError> {
        let ptr = VarPointer::new(idx, variable);
        self.ensure_state_variable(&ptr)?;

        // An entry request becomes a single-key request on its array.
        let forwarded = {
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
            match &var.kind {
                StateVarKind::ArrayEntry { array_name, key } => {
                    Some((VarPointer::new(idx, array_name.clone()), key.clone()))
                }
                _ => None,
            }
        };
        match forwarded {
            Some((array_ptr, key)) => {
                self.request_change_internal(&array_ptr, DesiredValue::key(key, value.into()), true)
            }
            None => self.request_change_internal(&ptr, DesiredValue::whole(value.into()), true),
        }
    }

    fn request_change_internal(
        &mut self,
        ptr: &VarPointer,
        desired: DesiredValue,
        initiating: bool,
    ) -> Result<(), CoreError> {
        let (fixed, fix_location, modify_indirectly, inverse, essential_write_allowed) = {
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
            (
                var.fixed,
                var.fix_location,
                var.modify_indirectly,
                var.inverse.clone(),
                var.essential_write_allowed,
            )
        };

        if fixed || fix_location {
            self.warnings.push(CoreWarning::new(
                ptr.component,
                format!("cannot change `{}`: the variable is fixed", ptr.variable),
            ));
            return Ok(());
        }
        if !initiating && !modify_indirectly {
            self.warnings.push(CoreWarning::new(
                ptr.component,
                format!(
                    "cannot change `{}` indirectly: the variable blocks indirect modification",
                    ptr.variable
                ),
            ));
            return Ok(());
        }
        let Some(inverse) = inverse else {
            debug!(pointer = %ptr, "no inverse definition; ignoring update request");
            return Ok(());
        };

        // Invert against fresh dependency values.
        self.freshen(ptr, None)?;
        let dependency_values = self.gather_dependency_values(ptr)?;
        let ctx = InverseContext {
            desired,
            dependency_values,
            initiating,
        };
        let result = (inverse.invert)(&ctx).map_err(CoreError::User)?;
        if !result.success {
            return Ok(());
        }

        for item in coalesce(result.instructions) {
            match item {
                Coalesced::Essential { key, value } => {
                    if !essential_write_allowed {
                        return Err(CoreError::DefinitionContract {
                            pointer: ptr.clone(),
                            message: format!(
                                "inverse of `{}` attempted a forbidden essential write",
                                ptr.variable
                            ),
                        });
                    }
                    self.write_essential_storage(ptr.component, &key, value, None)?;
                }
                Coalesced::Dependency { name, desired } => {
                    let source = self
                        .deps
                        .edges(ptr)
                        .iter()
                        .find(|edge| edge.name == name)
                        .map(|edge| edge.source.clone());
                    match source {
                        Some(DependencySource::StateVar { component, var }) => {
                            let next = VarPointer::new(component, var);
                            self.request_change_internal(&next, desired, false)?;
                        }
                        _ => {
                            self.warnings.push(CoreWarning::new(
                                ptr.component,
                                format!(
                                    "inverse of `{}` names dependency `{name}` that is not a state variable",
                                    ptr.variable
                                ),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Write one essential value, record it for persistence, mirror it to
    /// shadows, and invalidate its readers.
    ///
    /// Returns false without side effects when the stored value is already
    /// equal; an inverse round trip that reproduces the current state must
    /// not wake any dependents.
    pub(crate) fn write_essential_storage(
        &mut self,
        idx: ComponentIdx,
        key: &str,
        value: StateValue,
        exclude: Option<&VarPointer>,
    ) -> Result<bool, CoreError> {
        {
            let component = self
                .components
                .get_mut(idx)
                .ok_or(CoreError::ComponentNotFound(idx))?;
            if component.essential.get(key) == Some(&value) {
                return Ok(false);
            }
            component.essential.insert(key.to_string(), value.clone());
        }
        self.essential_changes
            .insert((idx, key.to_string()), value.clone());
        self.deps.record_essential_change(idx, key);
        self.sync_essential_to_shadows(idx, key, &value)?;
        self.invalidate_essential_readers(idx, key, exclude)?;
        Ok(true)
    }

    /// Mark everything reading one essential key stale.
    ///
    /// Declared essential edges and same-named essential-backed variables
    /// go fully stale; an array-element key (`values:2`) degrades only that
    /// key of the array.
    fn invalidate_essential_readers(
        &mut self,
        idx: ComponentIdx,
        key: &str,
        exclude: Option<&VarPointer>,
    ) -> Result<(), CoreError> {
        for reader in self.deps.essential_readers(idx, key).to_vec() {
            if exclude == Some(&reader) {
                continue;
            }
            self.set_variable_stale(&reader)?;
        }

        if let Some((var_name, array_key)) = array::split_essential_key(key) {
            self.invalidate_array_key(idx, var_name, array_key, exclude)?;
            return Ok(());
        }

        let direct = self
            .components
            .get(idx)
            .and_then(|c| c.state_var(key))
            .map(|v| (v.has_essential, v.for_renderer));
        if let Some((true, for_renderer)) = direct {
            let ptr = VarPointer::new(idx, key);
            if exclude != Some(&ptr) {
                // The write itself is an actual change even when the
                // variable was never read, so the renderer hears about it.
                if for_renderer {
                    self.queues.renderer.insert(idx);
                }
                self.set_variable_stale(&ptr)?;
            }
        }
        Ok(())
    }

    fn invalidate_array_key(
        &mut self,
        idx: ComponentIdx,
        var_name: &str,
        key: ArrayKey,
        exclude: Option<&VarPointer>,
    ) -> Result<(), CoreError> {
        let info = self
            .components
            .get(idx)
            .and_then(|c| c.state_var(var_name))
            .map(|v| {
                (
                    matches!(v.kind, StateVarKind::Array { .. }) && v.has_essential,
                    v.for_renderer,
                )
            });
        let Some((true, for_renderer)) = info else {
            return Ok(());
        };
        let ptr = VarPointer::new(idx, var_name);
        if exclude == Some(&ptr) {
            return Ok(());
        }
        if for_renderer {
            self.queues.renderer.insert(idx);
        }
        let mut stale_keys = std::collections::BTreeSet::new();
        stale_keys.insert(key.clone());
        let verdict = crate::definition::FreshnessVerdict::Partial {
            stale_keys,
            size_stale: false,
        };
        if self.apply_freshness_verdict(&ptr, &verdict)? {
            self.mark_upstream_stale(&ptr, &ChangeSummary::single_key(key))?;
        }
        Ok(())
    }
}

/// Merge adjacent by-key instructions naming the same dependency into one
/// combined request, so an upstream array sees a single inverse call.
fn coalesce(instructions: Vec<InverseInstruction>) -> Vec<Coalesced> {
    let mut out: Vec<Coalesced> = Vec::new();
    for instruction in instructions {
        match instruction {
            InverseInstruction::SetEssential { key, value } => {
                out.push(Coalesced::Essential { key, value });
            }
            InverseInstruction::SetDependency { dependency, desired } => {
                out.push(Coalesced::Dependency {
                    name: dependency,
                    desired: DesiredValue::whole(desired),
                });
            }
            InverseInstruction::SetDependencyKey {
                dependency,
                key,
                desired,
            } => {
                if let Some(Coalesced::Dependency { name, desired: run }) = out.last_mut() {
                    if *name == dependency && run.whole.is_none() {
                        run.keys.insert(key, desired);
                        continue;
                    }
                }
                out.push(Coalesced::Dependency {
                    name: dependency,
                    desired: DesiredValue::key(key, desired),
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_merges_adjacent_key_instructions() {
        let merged = coalesce(vec![
            InverseInstruction::SetDependencyKey {
                dependency: "list".into(),
                key: ArrayKey::from_index(0),
                desired: StateValue::Integer(1),
            },
            InverseInstruction::SetDependencyKey {
                dependency: "list".into(),
                key: ArrayKey::from_index(1),
                desired: StateValue::Integer(2),
            },
            InverseInstruction::SetDependencyKey {
                dependency: "other".into(),
                key: ArrayKey::from_index(0),
                desired: StateValue::Integer(3),
            },
        ]);
        assert_eq!(merged.len(), 2);
        match &merged[0] {
            Coalesced::Dependency { name, desired } => {
                assert_eq!(name, "list");
                assert_eq!(desired.keys.len(), 2);
            }
            Coalesced::Essential { .. } => panic!("expected dependency run"),
        }
    }
}
