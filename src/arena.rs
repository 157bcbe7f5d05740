//! The component table: a slot arena with never-reused indices.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::CoreError;

/// ComponentIdx is a unique identifier for a component.
///
/// Indices are assigned monotonically and never reused while the document
/// lives, which keeps external name resolution stable across deletions and
/// re-expansions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ComponentIdx(pub usize);

impl ComponentIdx {
    /// The raw index.
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ComponentIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of one arena slot.
///
/// `Reserved` marks an index that has been claimed but whose component is
/// not materialized yet; composite expansion reserves indices before it
/// builds replacement subtrees so sibling fragments can reference them.
#[derive(Debug)]
pub enum Slot {
    /// Index claimed, component not yet materialized.
    Reserved,
    /// Component existed here and was deleted. The index is retired.
    Vacant,
    /// A live component.
    Occupied(Component),
}

/// Arena of components keyed by monotonically assigned indices.
///
/// Deleted slots become `Vacant` holes; they are never handed out again.
#[derive(Debug, Default)]
pub struct ComponentTable {
    slots: Vec<Slot>,
}

impl ComponentTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next index, leaving its slot `Reserved`.
    pub fn reserve(&mut self) -> ComponentIdx {
        let idx = ComponentIdx(self.slots.len());
        self.slots.push(Slot::Reserved);
        idx
    }

    /// Materialize a component into a previously reserved slot.
    pub fn fill(&mut self, idx: ComponentIdx, component: Component) -> Result<(), CoreError> {
        match self.slots.get_mut(idx.0) {
            Some(slot @ Slot::Reserved) => {
                *slot = Slot::Occupied(component);
                Ok(())
            }
            _ => Err(CoreError::InvalidSlot(idx)),
        }
    }

    /// Reserve and fill in one step.
    pub fn insert(&mut self, build: impl FnOnce(ComponentIdx) -> Component) -> ComponentIdx {
        let idx = self.reserve();
        let component = build(idx);
        self.slots[idx.0] = Slot::Occupied(component);
        idx
    }

    /// Get a component if its slot is occupied.
    pub fn get(&self, idx: ComponentIdx) -> Option<&Component> {
        match self.slots.get(idx.0) {
            Some(Slot::Occupied(c)) => Some(c),
            _ => None,
        }
    }

    /// Get a component mutably if its slot is occupied.
    pub fn get_mut(&mut self, idx: ComponentIdx) -> Option<&mut Component> {
        match self.slots.get_mut(idx.0) {
            Some(Slot::Occupied(c)) => Some(c),
            _ => None,
        }
    }

    /// Returns true if the index refers to a live component.
    pub fn contains(&self, idx: ComponentIdx) -> bool {
        matches!(self.slots.get(idx.0), Some(Slot::Occupied(_)))
    }

    /// Retire a slot, returning the component that occupied it.
    ///
    /// The slot becomes `Vacant` and the index is never reused.
    pub fn remove(&mut self, idx: ComponentIdx) -> Option<Component> {
        match self.slots.get_mut(idx.0) {
            Some(slot @ Slot::Occupied(_)) => {
                let old = std::mem::replace(slot, Slot::Vacant);
                match old {
                    Slot::Occupied(c) => Some(c),
                    _ => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Number of live components.
    pub fn occupied_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_)))
            .count()
    }

    /// Total number of indices ever assigned, including retired ones.
    pub fn assigned_count(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over live components.
    pub fn iter(&self) -> impl Iterator<Item = (ComponentIdx, &Component)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied(c) => Some((ComponentIdx(i), c)),
            _ => None,
        })
    }

    /// Indices of live components, in assignment order.
    pub fn indices(&self) -> Vec<ComponentIdx> {
        self.iter().map(|(idx, _)| idx).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(idx: ComponentIdx) -> Component {
        Component::new(idx, "text", None, vec![])
    }

    #[test]
    fn test_indices_are_never_reused() {
        let mut table = ComponentTable::new();
        let a = table.insert(dummy);
        let b = table.insert(dummy);
        assert_eq!(a, ComponentIdx(0));
        assert_eq!(b, ComponentIdx(1));

        assert!(table.remove(a).is_some());
        assert!(!table.contains(a));

        // The retired index is a permanent hole.
        let c = table.insert(dummy);
        assert_eq!(c, ComponentIdx(2));
        assert!(table.get(a).is_none());
        assert_eq!(table.occupied_count(), 2);
        assert_eq!(table.assigned_count(), 3);
    }

    #[test]
    fn test_reserved_slot_is_not_occupied() {
        let mut table = ComponentTable::new();
        let idx = table.reserve();
        assert!(!table.contains(idx));
        assert!(table.get(idx).is_none());

        table.fill(idx, dummy(idx)).unwrap();
        assert!(table.contains(idx));

        // Filling twice is an error.
        assert!(matches!(
            table.fill(idx, dummy(idx)),
            Err(CoreError::InvalidSlot(_))
        ));
    }

    #[test]
    fn test_remove_vacant_is_none() {
        let mut table = ComponentTable::new();
        let idx = table.insert(dummy);
        assert!(table.remove(idx).is_some());
        assert!(table.remove(idx).is_none());
    }
}
