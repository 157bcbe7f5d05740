//! The component-type registry and the built-in types.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::arena::ComponentIdx;
use crate::array::{self, ArrayKey};
use crate::composite::{ReplacementChange, ReplacementSource};
use crate::core::DocumentCore;
use crate::definition::{
    ArrayBehavior, DefinitionResult, DepTarget, DependencySpec, FreshnessVerdict, Instruction,
    InverseDefinition, InverseInstruction, InverseResult, KeyInstruction, MarkStaleResult,
    SideEffects, StateVarDefinition,
};
use crate::serialized::SerializedComponent;
use crate::state::StateVar;
use crate::value::StateValue;

/// Declared shape of a templated state variable.
#[derive(Debug, Clone)]
pub enum TemplateKind {
    /// One value.
    Scalar,
    /// Keyed storage with lazily materialized entry views.
    Array {
        /// Number of dimensions.
        dimensions: usize,
        /// Prefix for 1-based entry-variable names.
        entry_prefix: Option<String>,
    },
}

/// Blueprint for one state variable of a component type.
#[derive(Clone)]
pub struct StateVarTemplate {
    /// Variable name.
    pub name: String,
    /// Shape.
    pub kind: TemplateKind,
    /// The definition table.
    pub definition: Arc<StateVarDefinition>,
    /// The inverse definition.
    pub inverse: Option<Arc<InverseDefinition>>,
    /// Sent to the renderer.
    pub for_renderer: bool,
    /// Declared default.
    pub default_value: StateValue,
    /// Owns essential storage.
    pub has_essential: bool,
    /// Rejects external updates.
    pub fixed: bool,
    /// Rejects external updates because it encodes tree position.
    pub fix_location: bool,
    /// Allows non-initiating inverse hops.
    pub modify_indirectly: bool,
}

impl StateVarTemplate {
    /// Scalar template with the essential-or-default calculate and matching
    /// inverse; the shape shared by the leaf input types.
    pub fn essential_scalar(name: &str, default: impl Into<StateValue>) -> Self {
        Self {
            name: name.to_string(),
            kind: TemplateKind::Scalar,
            definition: Arc::new(StateVarDefinition::essential_backed(name)),
            inverse: Some(Arc::new(InverseDefinition::set_essential(name))),
            for_renderer: true,
            default_value: default.into(),
            has_essential: true,
            fixed: false,
            fix_location: false,
            modify_indirectly: true,
        }
    }

    /// Instantiate the template into a live state variable.
    pub fn instantiate(&self) -> StateVar {
        let mut var = match &self.kind {
            TemplateKind::Scalar => StateVar::scalar(&self.name, Arc::clone(&self.definition)),
            TemplateKind::Array {
                dimensions,
                entry_prefix,
            } => {
                let mut var =
                    StateVar::array(&self.name, *dimensions, Arc::clone(&self.definition));
                var.entry_prefix = entry_prefix.clone();
                var
            }
        };
        var.inverse = self.inverse.clone();
        var.for_renderer = self.for_renderer;
        var.default_value = self.default_value.clone();
        var.has_essential = self.has_essential;
        var.fixed = self.fixed;
        var.fix_location = self.fix_location;
        var.modify_indirectly = self.modify_indirectly;
        var
    }

    /// Instantiate an entry view over one key of this (array) template.
    pub fn instantiate_entry(&self, key: ArrayKey) -> StateVar {
        let mut var = StateVar::entry(&self.name, key, Arc::clone(&self.definition));
        var.inverse = self.inverse.clone();
        var.default_value = self.default_value.clone();
        var.has_essential = self.has_essential;
        var.fixed = self.fixed;
        var.modify_indirectly = self.modify_indirectly;
        var
    }
}

/// Handler invoked by a queued action request.
pub type ActionFn = Arc<
    dyn Fn(&mut DocumentCore, ComponentIdx, &IndexMap<String, StateValue>) -> Result<(), anyhow::Error>
        + Send
        + Sync,
>;

/// Generates the initial replacements of a composite.
pub type ReplacementFn = Arc<
    dyn Fn(&mut DocumentCore, ComponentIdx) -> Result<ReplacementSource, anyhow::Error>
        + Send
        + Sync,
>;

/// Diffs a composite's replacements after its driving state changed.
pub type ReplacementChangesFn = Arc<
    dyn Fn(&mut DocumentCore, ComponentIdx) -> Result<Vec<ReplacementChange>, anyhow::Error>
        + Send
        + Sync,
>;

/// Everything the core knows about one component type.
#[derive(Clone)]
pub struct ComponentTypeDef {
    /// Registry tag.
    pub type_tag: &'static str,
    /// True for types expanded into replacements.
    pub is_composite: bool,
    /// Child types this type accepts; empty accepts anything.
    pub accepted_child_types: Vec<&'static str>,
    /// Types this one can stand in for during child matching.
    pub adapts_to: Vec<&'static str>,
    /// State-variable blueprints.
    pub state: Vec<StateVarTemplate>,
    /// Named action handlers.
    pub actions: IndexMap<&'static str, ActionFn>,
    /// Initial expansion, for composites.
    pub create_replacements: Option<ReplacementFn>,
    /// Incremental re-expansion, for composites.
    pub calculate_replacement_changes: Option<ReplacementChangesFn>,
}

impl ComponentTypeDef {
    fn leaf(type_tag: &'static str) -> Self {
        Self {
            type_tag,
            is_composite: false,
            accepted_child_types: Vec::new(),
            adapts_to: Vec::new(),
            state: Vec::new(),
            actions: IndexMap::new(),
            create_replacements: None,
            calculate_replacement_changes: None,
        }
    }
}

/// Registry of component types.
pub struct ComponentRegistry {
    types: HashMap<&'static str, Arc<ComponentTypeDef>>,
}

impl ComponentRegistry {
    /// An empty registry. Most callers want [`with_builtins`].
    ///
    /// [`with_builtins`]: ComponentRegistry::with_builtins
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// The registry preloaded with the built-in types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(number_type());
        registry.register(text_type());
        registry.register(boolean_type());
        registry.register(sum_type());
        registry.register(number_list_type());
        registry.register(group_type());
        registry.register(sequence_type());
        registry.register(copy_type());
        registry.register(error_type());
        registry
    }

    /// Register or replace a type.
    pub fn register(&mut self, def: ComponentTypeDef) {
        self.types.insert(def.type_tag, Arc::new(def));
    }

    /// Look up a type.
    pub fn get(&self, type_tag: &str) -> Option<Arc<ComponentTypeDef>> {
        self.types.get(type_tag).cloned()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn set_value_action(variable: &'static str) -> ActionFn {
    Arc::new(move |core, idx, args| {
        let value = args.get("value").cloned().unwrap_or(StateValue::Null);
        core.request_change(idx, variable, value)?;
        Ok(())
    })
}

fn number_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("number");
    def.state
        .push(StateVarTemplate::essential_scalar("value", StateValue::Integer(0)));
    def.actions.insert("setValue", set_value_action("value"));
    def
}

fn text_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("text");
    def.state
        .push(StateVarTemplate::essential_scalar("value", ""));
    def.actions.insert("setValue", set_value_action("value"));
    def
}

fn boolean_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("boolean");
    def.state
        .push(StateVarTemplate::essential_scalar("value", false));
    def.actions.insert("setValue", set_value_action("value"));
    def
}

/// `sum` gathers `value` across its active children and caches the total.
/// One-way: it declares no inverse.
fn sum_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("sum");
    def.state.push(StateVarTemplate {
        name: "value".into(),
        kind: TemplateKind::Scalar,
        definition: Arc::new(StateVarDefinition {
            dependencies: vec![(
                "children".into(),
                DependencySpec::ChildStateVars { var: "value".into() },
            )],
            calculate: Arc::new(|deps| {
                let total: f64 = deps
                    .value("children")
                    .as_list()
                    .unwrap_or(&[])
                    .iter()
                    .map(StateValue::coerce_number)
                    .sum();
                Ok(DefinitionResult::new().with_value("value", total))
            }),
            array: None,
            produces: vec!["value".into()],
            mark_stale: None,
        }),
        inverse: None,
        for_renderer: true,
        default_value: StateValue::Number(0.0),
        has_essential: false,
        fixed: false,
        fix_location: false,
        modify_indirectly: true,
    });
    def
}

/// `numberList` carries an essential-backed `count` and a 1-D `values`
/// array sized by it, with per-key essential storage and entry views
/// (`value1`, `value2`, ...).
fn number_list_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("numberList");

    def.state.push(StateVarTemplate {
        name: "count".into(),
        kind: TemplateKind::Scalar,
        definition: Arc::new(StateVarDefinition {
            dependencies: vec![
                (
                    "countAttr".into(),
                    DependencySpec::Attribute {
                        name: "count".into(),
                        default: StateValue::Integer(0),
                    },
                ),
            ],
            calculate: Arc::new(|deps| {
                let fallback = deps.value("countAttr").clone();
                let mut result = DefinitionResult::new();
                result.instructions.insert(
                    "count".into(),
                    Instruction::UseEssentialOrDefault {
                        fallback: Some(fallback),
                    },
                );
                Ok(result)
            }),
            array: None,
            produces: vec!["count".into()],
            mark_stale: None,
        }),
        inverse: Some(Arc::new(InverseDefinition::set_essential("count"))),
        for_renderer: true,
        default_value: StateValue::Integer(0),
        has_essential: true,
        fixed: false,
        fix_location: false,
        modify_indirectly: true,
    });

    def.state.push(StateVarTemplate {
        name: "values".into(),
        kind: TemplateKind::Array {
            dimensions: 1,
            entry_prefix: Some("value".into()),
        },
        definition: Arc::new(StateVarDefinition {
            dependencies: vec![(
                "count".into(),
                DependencySpec::StateVar {
                    target: DepTarget::SelfComponent,
                    var: "count".into(),
                },
            )],
            calculate: Arc::new(|_| Ok(DefinitionResult::new())),
            array: Some(ArrayBehavior {
                size: Arc::new(|deps| {
                    let count = deps.value("count").as_integer().unwrap_or(0).max(0);
                    Ok(vec![count as usize])
                }),
                calculate_keys: Arc::new(|keys, _| {
                    Ok(keys
                        .iter()
                        .map(|k| (k.clone(), KeyInstruction::UseEssentialOrDefault))
                        .collect())
                }),
            }),
            produces: vec!["values".into()],
            mark_stale: None,
        }),
        inverse: Some(Arc::new(InverseDefinition {
            invert: Arc::new(|ctx| {
                if ctx.desired.keys.is_empty() {
                    return Ok(InverseResult::failure());
                }
                let instructions = ctx
                    .desired
                    .keys
                    .iter()
                    .map(|(key, value)| InverseInstruction::SetEssential {
                        key: array::essential_key("values", key),
                        value: value.clone(),
                    })
                    .collect();
                Ok(InverseResult::with(instructions))
            }),
            essential_write_allowed: true,
        })),
        for_renderer: true,
        default_value: StateValue::Integer(0),
        has_essential: true,
        fixed: false,
        fix_location: false,
        modify_indirectly: true,
    });

    def
}

fn group_type() -> ComponentTypeDef {
    ComponentTypeDef::leaf("group")
}

/// `sequence` expands into `length` number replacements valued 1 through
/// `length`, and re-diffs them when `length` changes.
fn sequence_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("sequence");
    def.is_composite = true;

    def.state.push(StateVarTemplate {
        name: "length".into(),
        kind: TemplateKind::Scalar,
        definition: Arc::new(StateVarDefinition {
            dependencies: vec![(
                "lengthAttr".into(),
                DependencySpec::Attribute {
                    name: "length".into(),
                    default: StateValue::Integer(1),
                },
            )],
            calculate: Arc::new(|deps| {
                let fallback = deps.value("lengthAttr").clone();
                let mut result = DefinitionResult::new();
                result.instructions.insert(
                    "length".into(),
                    Instruction::UseEssentialOrDefault {
                        fallback: Some(fallback),
                    },
                );
                Ok(result)
            }),
            array: None,
            produces: vec!["length".into()],
            mark_stale: None,
        }),
        inverse: Some(Arc::new(InverseDefinition::set_essential("length"))),
        for_renderer: false,
        default_value: StateValue::Integer(1),
        has_essential: true,
        fixed: false,
        fix_location: false,
        modify_indirectly: true,
    });

    // The gate variable: a change to length queues a replacement re-diff
    // instead of propagating staleness further.
    def.state.push(StateVarTemplate {
        name: "readyToExpandWhenResolved".into(),
        kind: TemplateKind::Scalar,
        definition: Arc::new(StateVarDefinition {
            dependencies: vec![(
                "length".into(),
                DependencySpec::StateVar {
                    target: DepTarget::SelfComponent,
                    var: "length".into(),
                },
            )],
            calculate: Arc::new(|_| {
                Ok(DefinitionResult::new().with_value("readyToExpandWhenResolved", true))
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
    });

    def.create_replacements = Some(Arc::new(|core, idx| {
        let length = core.get_value(idx, "length")?.as_integer().unwrap_or(0).max(0);
        let replacements = (1..=length)
            .map(|i| SerializedComponent::new("number").with_state("value", i))
            .collect();
        Ok(ReplacementSource::Serialized(replacements))
    }));

    def.calculate_replacement_changes = Some(Arc::new(|core, idx| {
        let desired = core.get_value(idx, "length")?.as_integer().unwrap_or(0).max(0) as usize;
        let (materialized, withheld) = {
            let component = core
                .components
                .get(idx)
                .ok_or_else(|| anyhow::anyhow!("composite {idx} disappeared"))?;
            (component.replacements.len(), component.replacements_to_withhold)
        };
        let visible = materialized.saturating_sub(withheld);

        let mut changes = Vec::new();
        if desired > visible {
            // Restore withheld replacements first; they kept their indices
            // and essential state while hidden.
            let restore = (desired - visible).min(withheld);
            if restore > 0 {
                changes.push(ReplacementChange::ChangeWithheld {
                    count: withheld - restore,
                });
            }
            if desired > materialized {
                let fresh = (materialized + 1..=desired)
                    .map(|i| SerializedComponent::new("number").with_state("value", i))
                    .collect();
                changes.push(ReplacementChange::Add {
                    index: materialized,
                    components: fresh,
                });
            }
        } else if desired < visible {
            changes.push(ReplacementChange::ChangeWithheld {
                count: materialized - desired,
            });
        }
        Ok(changes)
    }));

    def
}

/// `copy` expands into a shadow of its target, wired so values forward from
/// the source and update requests forward back to it.
fn copy_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("copy");
    def.is_composite = true;
    def.create_replacements = Some(Arc::new(|core, idx| {
        let (target, prop) = {
            let component = core
                .components
                .get(idx)
                .ok_or_else(|| anyhow::anyhow!("composite {idx} disappeared"))?;
            let target = component
                .attribute("target")
                .and_then(StateValue::as_integer)
                .ok_or_else(|| anyhow::anyhow!("copy requires a `target` attribute"))?;
            let prop = component
                .attribute("prop")
                .and_then(|v| v.as_text().map(str::to_string));
            (ComponentIdx(target as usize), prop)
        };
        Ok(ReplacementSource::Shadow {
            source: target,
            prop,
        })
    }));
    def
}

fn error_type() -> ComponentTypeDef {
    let mut def = ComponentTypeDef::leaf("_error");
    let mut template = StateVarTemplate::essential_scalar("message", "");
    template.fixed = true;
    template.inverse = None;
    def.state.push(template);
    def
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateVarKind;

    #[test]
    fn test_builtins_are_registered() {
        let registry = ComponentRegistry::with_builtins();
        for tag in [
            "number",
            "text",
            "boolean",
            "sum",
            "numberList",
            "group",
            "sequence",
            "copy",
            "_error",
        ] {
            assert!(registry.get(tag).is_some(), "missing builtin {tag}");
        }
        assert!(registry.get("sequence").map(|d| d.is_composite).unwrap_or(false));
        assert!(registry.get("number").map(|d| !d.is_composite).unwrap_or(false));
    }

    #[test]
    fn test_essential_scalar_template_instantiates() {
        let template = StateVarTemplate::essential_scalar("value", StateValue::Integer(0));
        let var = template.instantiate();
        assert!(var.has_essential);
        assert!(var.for_renderer);
        assert!(var.inverse.is_some());
        assert!(matches!(var.kind, StateVarKind::Scalar));
    }
}
