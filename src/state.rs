//! State variables and graded freshness.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::array::{self, ArrayKey};
use crate::definition::{InverseDefinition, StateVarDefinition};
use crate::value::StateValue;

/// Shape of a state variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateVarKind {
    /// A single cached value.
    Scalar,
    /// Dense keyed storage with a dynamic size.
    Array {
        /// Number of dimensions.
        dimensions: usize,
    },
    /// A named view over one key of a sibling array variable.
    ArrayEntry {
        /// The array this entry views.
        array_name: String,
        /// The viewed key.
        key: ArrayKey,
    },
}

/// How much of a variable's cached value is currently trustworthy.
///
/// For an array variable, freshness is counted in units: one unit per fresh
/// key plus one unit for a fresh size. A scalar is simply `Stale` or
/// `Fresh`. The staleness walk prunes on this count: it recurses past a
/// variable only when the count strictly decreased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing cached is trustworthy.
    Stale,
    /// The whole cached value is trustworthy.
    Fresh,
    /// Some array keys (and possibly the size) are trustworthy.
    Partial {
        /// Keys whose cached values are trustworthy.
        fresh_keys: BTreeSet<ArrayKey>,
        /// Whether the cached size is trustworthy.
        size_fresh: bool,
    },
}

impl Freshness {
    /// Freshness count in units, given the array's total key count.
    ///
    /// Scalars pass `total_keys == 0`: `Fresh` counts 1, `Stale` counts 0.
    /// A fully fresh array counts `total_keys + 1`; an empty array with a
    /// known size counts 1 and reports as `Partial`.
    pub fn fresh_count(&self, total_keys: usize) -> usize {
        match self {
            Freshness::Stale => 0,
            Freshness::Fresh => total_keys + 1,
            Freshness::Partial {
                fresh_keys,
                size_fresh,
            } => fresh_keys.len() + usize::from(*size_fresh),
        }
    }

    /// True when nothing needs recomputation.
    pub fn is_fully_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }

    /// True when the cached value for one key is trustworthy.
    pub fn is_fresh_for(&self, key: &ArrayKey) -> bool {
        match self {
            Freshness::Stale => false,
            Freshness::Fresh => true,
            Freshness::Partial { fresh_keys, .. } => fresh_keys.contains(key),
        }
    }

    /// True when the cached array size is trustworthy.
    pub fn size_fresh(&self) -> bool {
        match self {
            Freshness::Stale => false,
            Freshness::Fresh => true,
            Freshness::Partial { size_fresh, .. } => *size_fresh,
        }
    }
}

/// One state variable of a component.
#[derive(Debug, Clone)]
pub struct StateVar {
    /// Shape.
    pub kind: StateVarKind,
    /// True once dependency setup has run for this variable.
    pub resolved: bool,
    /// How much of `value` is trustworthy.
    pub freshness: Freshness,
    /// The cached value. For arrays this is a `List` in row-major order;
    /// stale entries hold whatever was cached before.
    pub value: StateValue,
    /// Value archived when the variable first went stale, used for
    /// actual-change detection on recomputation.
    pub previous_value: Option<StateValue>,
    /// True when the last computation fell back to the declared default.
    pub used_default: bool,
    /// Declared default.
    pub default_value: StateValue,
    /// True when the variable owns essential storage.
    pub has_essential: bool,
    /// Key into the owner's essential map.
    pub essential_key: String,
    /// True when the renderer receives this variable's value.
    pub for_renderer: bool,
    /// True when external update requests must be rejected.
    pub fixed: bool,
    /// Like `fixed`, for variables encoding tree position.
    pub fix_location: bool,
    /// False blocks non-initiating inverse hops through this variable.
    pub modify_indirectly: bool,
    /// False rejects `SetEssential` instructions from the inverse path.
    /// Cleared on shadow-forwarded variables.
    pub essential_write_allowed: bool,
    /// Declared entry-name prefix for array variables.
    pub entry_prefix: Option<String>,
    /// The definition table.
    pub definition: Arc<StateVarDefinition>,
    /// The inverse definition, absent for one-way variables.
    pub inverse: Option<Arc<InverseDefinition>>,
    /// Current size, for array variables.
    pub array_size: Vec<usize>,
}

impl StateVar {
    /// A scalar variable with the given definition.
    pub fn scalar(name: &str, definition: Arc<StateVarDefinition>) -> Self {
        Self {
            kind: StateVarKind::Scalar,
            resolved: false,
            freshness: Freshness::Stale,
            value: StateValue::Null,
            previous_value: None,
            used_default: false,
            default_value: StateValue::Null,
            has_essential: false,
            essential_key: name.to_string(),
            for_renderer: false,
            fixed: false,
            fix_location: false,
            modify_indirectly: true,
            essential_write_allowed: true,
            entry_prefix: None,
            definition,
            inverse: None,
            array_size: Vec::new(),
        }
    }

    /// An array variable with the given definition. The definition must
    /// carry an `array` behavior.
    pub fn array(name: &str, dimensions: usize, definition: Arc<StateVarDefinition>) -> Self {
        let mut var = Self::scalar(name, definition);
        var.kind = StateVarKind::Array { dimensions };
        var.value = StateValue::List(Vec::new());
        var
    }

    /// An entry view over one key of a sibling array.
    pub fn entry(array_name: &str, key: ArrayKey, definition: Arc<StateVarDefinition>) -> Self {
        let mut var = Self::scalar(array_name, definition);
        var.essential_key = array::essential_key(array_name, &key);
        var.kind = StateVarKind::ArrayEntry {
            array_name: array_name.to_string(),
            key,
        };
        var
    }

    /// Total key count: zero for scalars and entries.
    pub fn total_keys(&self) -> usize {
        match &self.kind {
            StateVarKind::Array { .. } => array::total_keys(&self.array_size),
            _ => 0,
        }
    }

    /// Current freshness count in units.
    pub fn fresh_count(&self) -> usize {
        self.freshness.fresh_count(self.total_keys())
    }

    /// Archive the current value the first time freshness degrades, so the
    /// eventual recomputation can detect whether anything actually changed.
    pub fn archive_previous(&mut self) {
        if self.previous_value.is_none() {
            self.previous_value = Some(self.value.clone());
        }
    }
}
