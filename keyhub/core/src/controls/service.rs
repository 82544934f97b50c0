//! Control editing

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{HubError, HubResult};
use crate::model::{ActionEntry, ButtonStyle, ControlDefinition};
use crate::store::Store;

/// Create, restyle and delete controls
#[derive(Clone, Debug)]
pub struct ControlService {
    store: Arc<Store>,
}

impl ControlService {
    /// Create a service over `store`
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a button control
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the id is taken.
    pub fn create_button(&self, id: &str, style: ButtonStyle) -> HubResult<ControlDefinition> {
        let control = ControlDefinition::button(id, style);
        self.store.controls.insert(control.clone())?;
        info!(control_id = id, "Control created");
        Ok(control)
    }

    /// Replace a control's style; the render hash follows it
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown control.
    pub fn set_style(&self, id: &str, style: ButtonStyle) -> HubResult<()> {
        let updated = self.store.controls.update(id, |control| {
            control.set_style(style);
            control.touched_at = Utc::now();
        });
        if updated {
            Ok(())
        } else {
            Err(HubError::not_found("controls", id))
        }
    }

    /// Replace a control's press and release action lists
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown control or an entry targeting an unknown
    /// connection.
    pub fn set_actions(
        &self,
        id: &str,
        down_actions: Vec<ActionEntry>,
        up_actions: Vec<ActionEntry>,
    ) -> HubResult<()> {
        if let Some(entry) = down_actions
            .iter()
            .chain(&up_actions)
            .find(|entry| !self.store.connections.contains(&entry.connection_id))
        {
            return Err(HubError::not_found("connections", &entry.connection_id));
        }

        let updated = self.store.controls.update(id, |control| {
            control.down_actions = down_actions;
            control.up_actions = up_actions;
        });
        if updated {
            Ok(())
        } else {
            Err(HubError::not_found("controls", id))
        }
    }

    /// Delete a control, its press state, and every slot that shows it
    ///
    /// The render cache entry is removed by the render engine.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown control.
    pub fn delete_control(&self, id: &str) -> HubResult<()> {
        let store = &*self.store;
        let cleared = store.transaction(|tx| {
            if tx.delete(&store.controls, id) == 0 {
                return Err(HubError::not_found("controls", id));
            }
            tx.delete(&store.control_status, id);
            let referencing = tx.find(&store.spaces, |space| {
                space
                    .pages
                    .iter()
                    .any(|page| page.slots.values().any(|control| control == id))
            });
            for space in &referencing {
                tx.update(&store.spaces, &space.id, |space| {
                    for page in &mut space.pages {
                        page.slots.retain(|_, control| control != id);
                    }
                });
            }
            Ok(referencing.len())
        })?;

        info!(control_id = id, spaces = cleared, "Control deleted");
        Ok(())
    }
}
