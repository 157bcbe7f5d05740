//! Renderer-facing state updates.

use indexmap::IndexMap;

use crate::arena::ComponentIdx;
use crate::core::DocumentCore;
use crate::error::CoreError;
use crate::value::StateValue;

/// One component's renderer-visible state after a batch of work.
///
/// Values cover exactly the variables flagged `for_renderer`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderUpdate {
    /// The component.
    pub component: ComponentIdx,
    /// Renderer-flagged state values, freshened before emission.
    pub state_values: IndexMap<String, StateValue>,
    /// The active child list, present only when it changed since the last
    /// emission for this component.
    pub children: Option<Vec<ComponentIdx>>,
}

impl DocumentCore {
    /// Drain the renderer queue into a batch of updates.
    ///
    /// Every queued component's renderer-flagged variables are freshened
    /// before emission, so the renderer never sees a stale value.
    pub fn render_updates(&mut self) -> Result<Vec<RenderUpdate>, CoreError> {
        let queued: Vec<ComponentIdx> =
            std::mem::take(&mut self.queues.renderer).into_iter().collect();
        let mut updates = Vec::with_capacity(queued.len());
        for idx in queued {
            let Some(component) = self.components.get(idx) else {
                continue;
            };
            let renderer_vars: Vec<String> = component
                .state
                .iter()
                .filter(|(_, var)| var.for_renderer)
                .map(|(name, _)| name.clone())
                .collect();
            let mut state_values = IndexMap::with_capacity(renderer_vars.len());
            for name in renderer_vars {
                let value = self.get_value(idx, &name)?;
                state_values.insert(name, value);
            }
            let children = if self.queues.renderer_children.remove(&idx) {
                self.components.get(idx).map(|c| c.active_children.clone())
            } else {
                None
            };
            updates.push(RenderUpdate {
                component: idx,
                state_values,
                children,
            });
        }
        // Freshening within this pass can re-queue components already
        // emitted fresh; those entries carry no new information.
        for update in &updates {
            self.queues.renderer.remove(&update.component);
        }
        Ok(updates)
    }
}
