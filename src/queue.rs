//! The serialized request queue.
//!
//! External requests enter through a FIFO queue and are drained one at a
//! time; a request arriving while the drain is running is appended and
//! handled by the already-running drain, never recursively.

use std::collections::VecDeque;

use indexmap::IndexMap;
use slab::Slab;

use crate::arena::ComponentIdx;
use crate::value::StateValue;

/// A queued action invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Target component.
    pub component: ComponentIdx,
    /// Action name, as registered on the component type.
    pub action: String,
    /// Named arguments.
    pub args: IndexMap<String, StateValue>,
}

/// One external request.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreRequest {
    /// Two-way binding: drive a variable toward a desired value.
    UpdateValue {
        /// Target component.
        component: ComponentIdx,
        /// Target variable.
        variable: String,
        /// Desired value.
        value: StateValue,
        /// True for high-frequency intermediate values (a slider mid-drag)
        /// that may be dropped when a newer request for the same variable
        /// is already queued behind them.
        skippable: bool,
    },
    /// Invoke a registered action.
    Action(ActionRequest),
    /// Record an embedder event; carried through the queue so it serializes
    /// with the updates around it.
    RecordEvent {
        /// Event name.
        name: String,
        /// Opaque payload.
        data: StateValue,
    },
}

/// FIFO queue with handle-stable storage and skippable-request coalescing.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: Slab<CoreRequest>,
    order: VecDeque<usize>,
    draining: bool,
}

impl RequestQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request.
    ///
    /// When the request is a skippable update, older skippable updates for
    /// the same variable are dropped, except the last two queued items.
    /// Keeping those protects the request currently being processed and the
    /// one immediately after it from disappearing mid-flight.
    pub fn enqueue(&mut self, request: CoreRequest) {
        if let CoreRequest::UpdateValue {
            component,
            variable,
            skippable: true,
            ..
        } = &request
        {
            let protected: Vec<usize> = self.order.iter().rev().take(2).copied().collect();
            let stale: Vec<usize> = self
                .order
                .iter()
                .copied()
                .filter(|handle| {
                    if protected.contains(handle) {
                        return false;
                    }
                    matches!(
                        self.items.get(*handle),
                        Some(CoreRequest::UpdateValue {
                            component: c,
                            variable: v,
                            skippable: true,
                            ..
                        }) if c == component && v == variable
                    )
                })
                .collect();
            for handle in stale {
                self.items.remove(handle);
                self.order.retain(|h| *h != handle);
            }
        }
        let handle = self.items.insert(request);
        self.order.push_back(handle);
    }

    /// Pop the oldest request.
    pub fn pop(&mut self) -> Option<CoreRequest> {
        let handle = self.order.pop_front()?;
        Some(self.items.remove(handle))
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Claim the drain. Returns false when a drain is already running, in
    /// which case the caller must not process requests itself.
    pub fn begin_drain(&mut self) -> bool {
        if self.draining {
            return false;
        }
        self.draining = true;
        true
    }

    /// Release the drain.
    pub fn end_drain(&mut self) {
        self.draining = false;
    }
}
