//! Eager staleness propagation.
//!
//! When a value actually changes, staleness walks the dependents eagerly so
//! later reads know what to recompute. The walk prunes on the freshness
//! count: a dependent whose count did not strictly decrease was already at
//! least as stale, so everything above it is too.

use std::collections::BTreeSet;

use crate::array;
use crate::definition::{FreshnessVerdict, MarkStaleResult, StaleInfo};
use crate::deps::{ChangeSummary, VarPointer};
use crate::error::CoreError;
use crate::state::Freshness;

use crate::core::DocumentCore;

impl DocumentCore {
    /// Fully invalidate one variable and walk its dependents.
    pub(crate) fn set_variable_stale(&mut self, ptr: &VarPointer) -> Result<(), CoreError> {
        if self.apply_freshness_verdict(ptr, &FreshnessVerdict::Stale)? {
            self.mark_upstream_stale(ptr, &ChangeSummary::whole())?;
        }
        Ok(())
    }

    /// Degrade one variable's freshness per a verdict.
    ///
    /// Returns true when the freshness count strictly decreased. A deleted
    /// component or variable degrades to a no-op.
    pub(crate) fn apply_freshness_verdict(
        &mut self,
        ptr: &VarPointer,
        verdict: &FreshnessVerdict,
    ) -> Result<bool, CoreError> {
        let Some(component) = self.components.get_mut(ptr.component) else {
            return Ok(false);
        };
        let Some(var) = component.state_var_mut(&ptr.variable) else {
            return Ok(false);
        };

        let prior = var.fresh_count();
        match verdict {
            FreshnessVerdict::Fresh => {}
            FreshnessVerdict::Stale => {
                var.freshness = Freshness::Stale;
            }
            FreshnessVerdict::Partial {
                stale_keys,
                size_stale,
            } => {
                let (mut fresh_keys, mut size_fresh) = match &var.freshness {
                    Freshness::Fresh => (
                        array::all_array_keys(&var.array_size).into_iter().collect(),
                        true,
                    ),
                    Freshness::Partial {
                        fresh_keys,
                        size_fresh,
                    } => (fresh_keys.clone(), *size_fresh),
                    Freshness::Stale => (BTreeSet::new(), false),
                };
                for key in stale_keys {
                    fresh_keys.remove(key);
                }
                if *size_stale {
                    size_fresh = false;
                }
                var.freshness = Freshness::Partial {
                    fresh_keys,
                    size_fresh,
                };
            }
        }
        let now = var.fresh_count();
        let decreased = now < prior;
        if decreased {
            var.archive_previous();
            if var.for_renderer {
                self.queues.renderer.insert(ptr.component);
            }
        }
        Ok(decreased)
    }

    /// Walk dependents of a changed variable, degrading their freshness.
    ///
    /// Each dependent's `mark_stale` hook (full invalidation when absent)
    /// decides how far its freshness falls and which deferred side effects
    /// to queue. The walk recurses past a dependent only when its freshness
    /// count strictly decreased, which bounds every walk: counts only fall.
    pub(crate) fn mark_upstream_stale(
        &mut self,
        origin: &VarPointer,
        summary: &ChangeSummary,
    ) -> Result<(), CoreError> {
        let mut worklist: Vec<(VarPointer, ChangeSummary)> =
            vec![(origin.clone(), summary.clone())];

        while let Some((ptr, summary)) = worklist.pop() {
            let dependents = self.deps.dependents(&ptr).to_vec();
            for dependent in dependents {
                let hook = {
                    let Some(component) = self.components.get(dependent.component) else {
                        continue;
                    };
                    let Some(var) = component.state_var(&dependent.variable) else {
                        continue;
                    };
                    var.definition.mark_stale.clone()
                };

                let result = match hook {
                    Some(hook) => {
                        let info = StaleInfo {
                            changed_dependencies: self.deps.edge_names_reading(&dependent, &ptr),
                            changed_keys: summary.keys.clone(),
                            size_changed: summary.size_changed,
                        };
                        hook(&info)
                    }
                    None => MarkStaleResult::stale(),
                };

                let fx = result.side_effects;
                if fx.update_renderer {
                    self.queues.renderer.insert(dependent.component);
                }
                if fx.update_replacements {
                    self.queues.replacements.insert(dependent.component);
                }
                if fx.update_action_chaining {
                    self.queues.action_chain.push(dependent.clone());
                }
                if fx.update_dependencies {
                    self.queues.dependency_setup.insert(dependent.component);
                }

                if self.apply_freshness_verdict(&dependent, &result.verdict)? {
                    let next = match result.verdict {
                        FreshnessVerdict::Stale => ChangeSummary::whole(),
                        FreshnessVerdict::Partial {
                            stale_keys,
                            size_stale,
                        } => ChangeSummary::keys(stale_keys, size_stale),
                        FreshnessVerdict::Fresh => continue,
                    };
                    worklist.push((dependent, next));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialized::SerializedComponent;

    #[test]
    fn test_walk_prunes_on_already_stale() {
        let mut core = DocumentCore::with_builtins();
        core.build(vec![SerializedComponent::new("sum")
            .with_child(SerializedComponent::new("number").with_state("value", 2i64))])
            .unwrap();
        let sum = core.roots[0];
        let number = core
            .components
            .get(sum)
            .unwrap()
            .active_children
            .first()
            .copied()
            .unwrap();

        // Never evaluated yet, so everything starts stale and the walk has
        // nothing to degrade.
        core.set_variable_stale(&VarPointer::new(number, "value"))
            .unwrap();
        assert_eq!(core.get_value(sum, "value").unwrap().coerce_number(), 2.0);

        // A fresh chain degrades end to end.
        core.set_variable_stale(&VarPointer::new(number, "value"))
            .unwrap();
        let var = core
            .components
            .get(sum)
            .unwrap()
            .state_var("value")
            .unwrap();
        assert_eq!(var.fresh_count(), 0);
    }
}
