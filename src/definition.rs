//! Definition and inverse-definition contracts.
//!
//! A state variable's behavior is a table of pure functions: a `calculate`
//! function from gathered dependency values to instructions, an optional
//! by-key array behavior, an optional `mark_stale` hook consulted by the
//! staleness propagator, and an optional inverse definition that turns a
//! desired value into upstream update instructions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::array::ArrayKey;
use crate::error::CoreWarning;
use crate::value::StateValue;

/// Which component a declared dependency points at, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepTarget {
    /// The component owning the variable.
    SelfComponent,
    /// The owning component's parent.
    Parent,
    /// The component this one shadows. Resolution fails when the owner is
    /// not a shadow.
    ShadowSource,
    /// A fixed component index, used by forwarding definitions installed at
    /// shadow creation time.
    Component(crate::arena::ComponentIdx),
}

/// A declared dependency of a definition, resolved into concrete edges by
/// the dependency handler.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencySpec {
    /// Another state variable's value.
    StateVar {
        /// Which component carries the variable.
        target: DepTarget,
        /// The variable name.
        var: String,
    },
    /// The values of one variable across the owner's active children.
    ///
    /// Children that do not declare the variable (and cannot be coerced to a
    /// type that does) are skipped. The gathered value is a `List`.
    ChildStateVars {
        /// The variable to collect from each child.
        var: String,
    },
    /// An authored attribute on the owning component.
    Attribute {
        /// Attribute name.
        name: String,
        /// Value used when the attribute is absent.
        default: StateValue,
    },
    /// The owner's essential storage under the given key.
    Essential {
        /// Essential-storage key.
        key: String,
    },
}

/// One gathered dependency value handed to `calculate`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DependencyValue {
    /// The current value.
    pub value: StateValue,
    /// True when this dependency changed since the variable last computed.
    pub changed: bool,
    /// For array dependencies, which keys changed (empty means unknown or
    /// whole-value change).
    pub changed_keys: BTreeSet<ArrayKey>,
    /// True when the dependency's value came from an unmodified default.
    pub used_default: bool,
}

/// The bundle of dependency values for one computation, keyed by the
/// dependency names the definition declared.
#[derive(Debug, Clone, Default)]
pub struct DependencyValues {
    map: IndexMap<String, DependencyValue>,
}

impl DependencyValues {
    /// Empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a gathered value under its declared name.
    pub fn insert(&mut self, name: impl Into<String>, value: DependencyValue) {
        self.map.insert(name.into(), value);
    }

    /// Full record for one dependency.
    pub fn get(&self, name: &str) -> Option<&DependencyValue> {
        self.map.get(name)
    }

    /// The value of one dependency; `Null` when the name is unknown.
    pub fn value(&self, name: &str) -> &StateValue {
        static NULL: StateValue = StateValue::Null;
        self.map.get(name).map(|d| &d.value).unwrap_or(&NULL)
    }

    /// Whether one dependency changed since the last computation.
    pub fn changed(&self, name: &str) -> bool {
        self.map.get(name).map(|d| d.changed).unwrap_or(false)
    }

    /// Names of dependencies that changed.
    pub fn changed_names(&self) -> Vec<&str> {
        self.map
            .iter()
            .filter(|(_, d)| d.changed)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Iterate over all gathered values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DependencyValue)> {
        self.map.iter().map(|(n, d)| (n.as_str(), d))
    }
}

/// Instruction for one produced variable.
///
/// A definition jointly produces every variable in its `produces` list and
/// must give each an instruction; a missing instruction is a fatal
/// definition-contract error.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Cache this concrete value.
    SetValue(StateValue),
    /// Take the essential value if present, otherwise the fallback (or the
    /// variable's declared default when no fallback is given), and record
    /// whether the default was used.
    UseEssentialOrDefault {
        /// Value to fall back to before the declared default.
        fallback: Option<StateValue>,
    },
    /// Write the owner's essential storage and cache the same value.
    SetEssential(StateValue),
    /// Cache the declared default and flag the variable as defaulted.
    MarkAsUsedDefault,
    /// Keep the previously cached value.
    NoChanges,
    /// Declare the array's new size; storage is resized and shifted keys go
    /// stale before per-key definitions re-run. Takes precedence over
    /// [`ArrayBehavior::size`]; misapplied to a scalar it is a contract
    /// violation.
    ArraySizeChanged(Vec<usize>),
}

/// Result of one `calculate` invocation: per-variable instructions plus
/// localized warnings.
#[derive(Debug, Clone, Default)]
pub struct DefinitionResult {
    /// Instruction per produced variable.
    pub instructions: IndexMap<String, Instruction>,
    /// Non-fatal problems to attach to the owning component.
    pub warnings: Vec<CoreWarning>,
}

impl DefinitionResult {
    /// Empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a concrete value for one variable.
    pub fn with_value(mut self, var: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.instructions
            .insert(var.into(), Instruction::SetValue(value.into()));
        self
    }

    /// Use essential-or-default for one variable.
    pub fn with_essential_or_default(
        mut self,
        var: impl Into<String>,
        fallback: Option<StateValue>,
    ) -> Self {
        self.instructions
            .insert(var.into(), Instruction::UseEssentialOrDefault { fallback });
        self
    }

    /// Mark one variable explicitly unchanged.
    pub fn with_no_changes(mut self, var: impl Into<String>) -> Self {
        self.instructions.insert(var.into(), Instruction::NoChanges);
        self
    }

    /// Mark one variable as having used its default.
    pub fn with_used_default(mut self, var: impl Into<String>) -> Self {
        self.instructions
            .insert(var.into(), Instruction::MarkAsUsedDefault);
        self
    }

    /// Write essential storage for one variable.
    pub fn with_essential_value(
        mut self,
        var: impl Into<String>,
        value: impl Into<StateValue>,
    ) -> Self {
        self.instructions
            .insert(var.into(), Instruction::SetEssential(value.into()));
        self
    }

    /// Attach a warning.
    pub fn with_warning(mut self, warning: CoreWarning) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Per-key instruction for array definitions.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyInstruction {
    /// Cache this value for the key.
    SetValue(StateValue),
    /// Take the key's essential value if present, otherwise the declared
    /// default.
    UseEssentialOrDefault,
    /// Keep the key's previous value.
    NoChange,
}

/// Function computing a scalar definition.
pub type CalcFn =
    Arc<dyn Fn(&DependencyValues) -> Result<DefinitionResult, anyhow::Error> + Send + Sync>;

/// Function computing an array's size from its dependency values.
pub type SizeFn = Arc<dyn Fn(&DependencyValues) -> Result<Vec<usize>, anyhow::Error> + Send + Sync>;

/// Function computing values for a requested set of stale keys.
///
/// Only stale keys are requested; this is what makes partial recomputation
/// possible. Every requested key must receive an instruction.
pub type KeysFn = Arc<
    dyn Fn(&[ArrayKey], &DependencyValues) -> Result<BTreeMap<ArrayKey, KeyInstruction>, anyhow::Error>
        + Send
        + Sync,
>;

/// By-key behavior of an array variable.
#[derive(Clone)]
pub struct ArrayBehavior {
    /// Compute the array size.
    pub size: SizeFn,
    /// Compute values for stale keys.
    pub calculate_keys: KeysFn,
}

/// Context handed to a `mark_stale` hook.
#[derive(Debug, Clone, Default)]
pub struct StaleInfo {
    /// Names of the variable's dependencies that changed downstream.
    pub changed_dependencies: Vec<String>,
    /// Key-level change information for array dependencies, when known.
    pub changed_keys: BTreeSet<ArrayKey>,
    /// True when a dependency's array size changed.
    pub size_changed: bool,
}

/// Freshness verdict returned by a `mark_stale` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreshnessVerdict {
    /// Invalidate everything (the default hook behavior).
    Stale,
    /// Invalidate only part of an array.
    Partial {
        /// Keys to invalidate.
        stale_keys: BTreeSet<ArrayKey>,
        /// Whether the size itself is now unknown.
        size_stale: bool,
    },
    /// The change does not affect this variable's cached value.
    Fresh,
}

/// Deferred side-effect requests returned by a `mark_stale` hook.
///
/// These are queued per operation and executed in a batch after the walk,
/// never inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SideEffects {
    /// Re-send the owner's renderer-marked state.
    pub update_renderer: bool,
    /// Re-diff the owner's composite replacements.
    pub update_replacements: bool,
    /// Re-run chained actions attached to the variable.
    pub update_action_chaining: bool,
    /// Re-run dependency setup for the owner.
    pub update_dependencies: bool,
}

/// Result of one `mark_stale` hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkStaleResult {
    /// How much freshness survives.
    pub verdict: FreshnessVerdict,
    /// Deferred work requests.
    pub side_effects: SideEffects,
}

impl MarkStaleResult {
    /// Full invalidation with no side effects, the default hook behavior.
    pub fn stale() -> Self {
        Self {
            verdict: FreshnessVerdict::Stale,
            side_effects: SideEffects::default(),
        }
    }
}

/// Function deciding how stale a variable becomes when a dependency changes.
pub type MarkStaleFn = Arc<dyn Fn(&StaleInfo) -> MarkStaleResult + Send + Sync>;

/// The definition table of one state variable.
#[derive(Clone)]
pub struct StateVarDefinition {
    /// Declared dependencies, by name.
    pub dependencies: Vec<(String, DependencySpec)>,
    /// Scalar computation. For array variables with an `array` behavior this
    /// is not consulted.
    pub calculate: CalcFn,
    /// By-key behavior for array variables.
    pub array: Option<ArrayBehavior>,
    /// Every variable this definition jointly produces, the variable's own
    /// name included.
    pub produces: Vec<String>,
    /// Optional staleness hook; absent means full invalidation.
    pub mark_stale: Option<MarkStaleFn>,
}

impl StateVarDefinition {
    /// A definition with no dependencies that always defers to essential
    /// storage or the declared default.
    pub fn essential_backed(name: &str) -> Self {
        let var = name.to_string();
        StateVarDefinition {
            dependencies: vec![],
            calculate: Arc::new(move |_| {
                Ok(DefinitionResult::new().with_essential_or_default(var.clone(), None))
            }),
            array: None,
            produces: vec![name.to_string()],
            mark_stale: None,
        }
    }
}

impl std::fmt::Debug for StateVarDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateVarDefinition")
            .field("dependencies", &self.dependencies)
            .field("produces", &self.produces)
            .field("is_array", &self.array.is_some())
            .field("has_mark_stale", &self.mark_stale.is_some())
            .finish()
    }
}

/// Desired-value payload for an inverse request.
#[derive(Debug, Clone, Default)]
pub struct DesiredValue {
    /// Whole-value request, when present.
    pub whole: Option<StateValue>,
    /// By-key requests for array variables; populated by entry forwarding
    /// and by instruction coalescing.
    pub keys: BTreeMap<ArrayKey, StateValue>,
}

impl DesiredValue {
    /// A whole-value request.
    pub fn whole(value: StateValue) -> Self {
        Self {
            whole: Some(value),
            keys: BTreeMap::new(),
        }
    }

    /// A single-key request.
    pub fn key(key: ArrayKey, value: StateValue) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(key, value);
        Self { whole: None, keys }
    }
}

/// Context handed to an inverse definition.
#[derive(Debug, Clone)]
pub struct InverseContext {
    /// What the caller wants the variable to become.
    pub desired: DesiredValue,
    /// Current dependency values, gathered fresh.
    pub dependency_values: DependencyValues,
    /// True on the hop the external request entered at.
    pub initiating: bool,
}

/// One upstream update instruction produced by an inverse definition.
#[derive(Debug, Clone, PartialEq)]
pub enum InverseInstruction {
    /// Terminal write into the owner's essential storage.
    SetEssential {
        /// Essential-storage key.
        key: String,
        /// Value to store.
        value: StateValue,
    },
    /// Recursively request a desired value on one named dependency.
    SetDependency {
        /// The dependency name, as declared by the definition.
        dependency: String,
        /// Desired whole value for the upstream variable.
        desired: StateValue,
    },
    /// Recursively request a desired value for one key of an upstream array
    /// dependency. Adjacent instructions naming the same dependency are
    /// coalesced into one combined by-key request before recursing.
    SetDependencyKey {
        /// The dependency name.
        dependency: String,
        /// The upstream array key.
        key: ArrayKey,
        /// Desired value for that key.
        desired: StateValue,
    },
}

/// Result of an inverse definition: failure (a silent no-op) or a list of
/// update instructions.
#[derive(Debug, Clone, Default)]
pub struct InverseResult {
    /// False rejects the request without error.
    pub success: bool,
    /// Instructions to apply, in order.
    pub instructions: Vec<InverseInstruction>,
}

impl InverseResult {
    /// Reject the request.
    pub fn failure() -> Self {
        Self::default()
    }

    /// Accept with the given instructions.
    pub fn with(instructions: Vec<InverseInstruction>) -> Self {
        Self {
            success: true,
            instructions,
        }
    }
}

/// Function translating a desired value into upstream instructions.
pub type InverseFn =
    Arc<dyn Fn(&InverseContext) -> Result<InverseResult, anyhow::Error> + Send + Sync>;

/// The inverse-definition table of one state variable.
#[derive(Clone)]
pub struct InverseDefinition {
    /// The translation function.
    pub invert: InverseFn,
    /// Whether essential writes through this definition are allowed.
    ///
    /// False on shadow-forwarding definitions: a shadow writing its own
    /// essential storage would silently diverge from its source.
    pub essential_write_allowed: bool,
}

impl InverseDefinition {
    /// An inverse that writes the variable's own essential storage.
    pub fn set_essential(name: &str) -> Self {
        let var = name.to_string();
        InverseDefinition {
            invert: Arc::new(move |ctx| {
                let Some(value) = ctx.desired.whole.clone() else {
                    return Ok(InverseResult::failure());
                };
                Ok(InverseResult::with(vec![InverseInstruction::SetEssential {
                    key: var.clone(),
                    value,
                }]))
            }),
            essential_write_allowed: true,
        }
    }
}

impl std::fmt::Debug for InverseDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InverseDefinition")
            .field("essential_write_allowed", &self.essential_write_allowed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_result_builder() {
        let result = DefinitionResult::new()
            .with_value("value", 3i64)
            .with_no_changes("other");
        assert_eq!(
            result.instructions.get("value"),
            Some(&Instruction::SetValue(StateValue::Integer(3)))
        );
        assert_eq!(
            result.instructions.get("other"),
            Some(&Instruction::NoChanges)
        );
    }

    #[test]
    fn test_dependency_values_changed_names() {
        let mut values = DependencyValues::new();
        values.insert(
            "a",
            DependencyValue {
                value: StateValue::Integer(1),
                changed: true,
                ..Default::default()
            },
        );
        values.insert("b", DependencyValue::default());
        assert_eq!(values.changed_names(), vec!["a"]);
        assert!(values.changed("a"));
        assert!(!values.changed("b"));
        assert_eq!(values.value("missing"), &StateValue::Null);
    }

    #[test]
    fn test_set_essential_inverse_requires_whole_value() {
        let inverse = InverseDefinition::set_essential("value");
        let ctx = InverseContext {
            desired: DesiredValue::default(),
            dependency_values: DependencyValues::new(),
            initiating: true,
        };
        let result = (inverse.invert)(&ctx).unwrap();
        assert!(!result.success);

        let ctx = InverseContext {
            desired: DesiredValue::whole(StateValue::Integer(7)),
            dependency_values: DependencyValues::new(),
            initiating: true,
        };
        let result = (inverse.invert)(&ctx).unwrap();
        assert!(result.success);
        assert_eq!(
            result.instructions,
            vec![InverseInstruction::SetEssential {
                key: "value".into(),
                value: StateValue::Integer(7),
            }]
        );
    }
}
