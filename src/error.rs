//! Error and warning types for the document core.

use serde::Serialize;
use thiserror::Error;

use crate::arena::ComponentIdx;
use crate::deps::VarPointer;

/// Errors raised by the document core.
///
/// Variants split into recoverable content problems (surfaced as
/// [`CoreWarning`]s or `_error` placeholder components before they ever reach
/// this enum), and fatal problems that reject the current operation:
/// definition-contract violations, forced resolutions that cannot succeed,
/// and dependency cycles detected before any tree exists.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The component index does not refer to an occupied slot.
    #[error("component {0} not found")]
    ComponentNotFound(ComponentIdx),

    /// A slot operation was applied to a slot in the wrong state.
    #[error("slot {0} is not in the expected state")]
    InvalidSlot(ComponentIdx),

    /// The component declares no state variable with this name.
    #[error("state variable {variable} not found on component {component}")]
    VariableNotFound {
        /// Component that was asked for the variable.
        component: ComponentIdx,
        /// Name of the missing variable.
        variable: String,
    },

    /// The serialized tree named a component type absent from the registry.
    ///
    /// During a build this is degraded to an `_error` placeholder; it is
    /// returned directly only when the `_error` type itself is missing.
    #[error("unknown component type `{0}`")]
    UnknownComponentType(String),

    /// A forced value read could not resolve the variable.
    #[error("could not resolve {pointer} when resolution was forced")]
    ResolutionFailed {
        /// The variable that failed to resolve.
        pointer: VarPointer,
    },

    /// A definition broke its declared contract.
    ///
    /// Examples: failing to supply a value or an explicit "unchanged" marker
    /// for a jointly produced variable, or writing essential state through a
    /// shadow that is not marked safe for essential writes.
    #[error("definition contract violated for {pointer}: {message}")]
    DefinitionContract {
        /// The variable whose definition misbehaved.
        pointer: VarPointer,
        /// What the definition did wrong.
        message: String,
    },

    /// Dependency cycle detected.
    ///
    /// The `path` contains a debug representation of the cycle, innermost
    /// revisit last.
    #[error("circular dependency detected: {}", .path.join(" -> "))]
    Cycle {
        /// Debug representation of the participants forming the cycle.
        path: Vec<String>,
    },

    /// Replacement-change propagation did not settle within the iteration cap.
    #[error("replacement updates did not settle within {max} iterations")]
    ReplacementLoop {
        /// The configured iteration cap.
        max: usize,
    },

    /// Error raised by a definition body, action handler, or replacement
    /// generator.
    ///
    /// Carried opaquely so component types can surface domain failures
    /// without the core knowing their concrete error types.
    #[error("user error: {0}")]
    User(#[from] anyhow::Error),
}

impl CoreError {
    /// Returns the inner user error if this is the `User` variant.
    pub fn user_error(&self) -> Option<&anyhow::Error> {
        match self {
            CoreError::User(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }
}

/// A localized, non-fatal content problem.
///
/// Warnings never abort the surrounding build; they attach to the smallest
/// subtree that caused them and accumulate on the core for the embedder to
/// display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreWarning {
    /// Component the warning is localized to, if a tree exists yet.
    pub component: Option<ComponentIdx>,
    /// Human-readable description.
    pub message: String,
}

impl CoreWarning {
    /// Create a warning localized to a component.
    pub fn new(component: ComponentIdx, message: impl Into<String>) -> Self {
        Self {
            component: Some(component),
            message: message.into(),
        }
    }

    /// Create a warning with no tree location.
    pub fn unlocated(message: impl Into<String>) -> Self {
        Self {
            component: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_joins_path() {
        let err = CoreError::Cycle {
            path: vec!["1.value".into(), "2.value".into(), "1.value".into()],
        };
        assert_eq!(
            err.to_string(),
            "circular dependency detected: 1.value -> 2.value -> 1.value"
        );
    }

    #[test]
    fn test_user_error_downcast() {
        let err: CoreError = anyhow::Error::new(std::fmt::Error).into();
        assert!(err.downcast_ref::<std::fmt::Error>().is_some());
        assert!(err.user_error().is_some());
    }
}
