//! Space, page and slot editing
//!
//! Every mutation checks its preconditions and writes inside one store
//! transaction; a failed check writes nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{HubError, HubResult};
use crate::model::{Page, SpaceShape, SurfaceSpace};
use crate::store::Store;

/// Transactional space editing
#[derive(Clone, Debug)]
pub struct SpaceService {
    store: Arc<Store>,
}

impl SpaceService {
    /// Create a service over `store`
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a space with one empty page
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the id is taken.
    pub fn create_space(&self, id: &str, name: &str, shape: SpaceShape) -> HubResult<SurfaceSpace> {
        let space = SurfaceSpace {
            id: id.to_string(),
            name: name.to_string(),
            shape,
            pages: vec![new_page("Page 1")],
        };
        self.store.spaces.insert(space.clone())?;
        info!(space_id = id, "Space created");
        Ok(space)
    }

    /// Append a page; returns its id
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown space.
    pub fn add_page(&self, space_id: &str, name: &str) -> HubResult<String> {
        let page = new_page(name);
        let page_id = page.id.clone();
        let store = &*self.store;
        store.transaction(|tx| {
            let modified = tx.update(&store.spaces, space_id, |space| space.pages.push(page));
            if modified == 0 {
                return Err(HubError::not_found("spaces", space_id));
            }
            Ok(())
        })?;
        Ok(page_id)
    }

    /// Show `control_id` in a slot
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown space, page or control.
    pub fn set_slot(
        &self,
        space_id: &str,
        page_id: &str,
        slot_id: &str,
        control_id: &str,
    ) -> HubResult<()> {
        let store = &*self.store;
        store.transaction(|tx| {
            let space = tx
                .get(&store.spaces, space_id)
                .ok_or_else(|| HubError::not_found("spaces", space_id))?;
            if !space.pages.iter().any(|p| p.id == page_id) {
                return Err(HubError::not_found("pages", page_id));
            }
            if tx.get(&store.controls, control_id).is_none() {
                return Err(HubError::not_found("controls", control_id));
            }
            tx.update(&store.spaces, space_id, |space| {
                if let Some(page) = space.pages.iter_mut().find(|p| p.id == page_id) {
                    page.slots
                        .insert(slot_id.to_string(), control_id.to_string());
                }
            });
            Ok(())
        })
    }

    /// Empty a slot; emptying an empty slot is not an error
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown space or page.
    pub fn clear_slot(&self, space_id: &str, page_id: &str, slot_id: &str) -> HubResult<()> {
        let store = &*self.store;
        store.transaction(|tx| {
            let space = tx
                .get(&store.spaces, space_id)
                .ok_or_else(|| HubError::not_found("spaces", space_id))?;
            let Some(page) = space.pages.iter().find(|p| p.id == page_id) else {
                return Err(HubError::not_found("pages", page_id));
            };
            if page.slots.contains_key(slot_id) {
                tx.update(&store.spaces, space_id, |space| {
                    if let Some(page) = space.pages.iter_mut().find(|p| p.id == page_id) {
                        page.slots.remove(slot_id);
                    }
                });
            }
            Ok(())
        })
    }

    /// Delete a space and unbind every device showing it
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown space.
    pub fn delete_space(&self, space_id: &str) -> HubResult<()> {
        let store = &*self.store;
        let bound = store
            .surface_devices
            .find(|device| device.space_id.as_deref() == Some(space_id));

        store.transaction(|tx| {
            if tx.delete(&store.spaces, space_id) == 0 {
                return Err(HubError::not_found("spaces", space_id));
            }
            for device in &bound {
                tx.update(&store.surface_devices, &device.id, |device| {
                    device.space_id = None;
                });
            }
            Ok(())
        })?;
        info!(space_id, unbound = bound.len(), "Space deleted");
        Ok(())
    }
}

fn new_page(name: &str) -> Page {
    Page {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        slots: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ButtonStyle, ControlDefinition, DeviceStatus, SurfaceDevice};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn shape() -> SpaceShape {
        SpaceShape {
            columns: 8,
            rows: 4,
            kind: "grid".to_string(),
        }
    }

    fn setup() -> (Arc<Store>, SpaceService, SurfaceSpace) {
        let store = Arc::new(Store::in_memory());
        let service = SpaceService::new(Arc::clone(&store));
        let space = service.create_space("s1", "Main", shape()).unwrap();
        store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::default()));
        (store, service, space)
    }

    #[test]
    fn test_set_and_clear_slot() {
        let (store, service, space) = setup();
        let page_id = &space.pages[0].id;

        service.set_slot("s1", page_id, "0x0", "c1").unwrap();
        let stored = store.spaces.require("s1").unwrap();
        assert_eq!(stored.pages[0].slots.get("0x0").map(String::as_str), Some("c1"));

        service.clear_slot("s1", page_id, "0x0").unwrap();
        service.clear_slot("s1", page_id, "0x0").unwrap();
        assert!(store.spaces.require("s1").unwrap().pages[0].slots.is_empty());
    }

    #[test]
    fn test_set_slot_preconditions_write_nothing() {
        let (store, service, space) = setup();
        let page_id = &space.pages[0].id;

        assert!(service.set_slot("s1", page_id, "0x0", "ghost").unwrap_err().is_not_found());
        assert!(service.set_slot("s1", "no-page", "0x0", "c1").unwrap_err().is_not_found());
        assert!(service.set_slot("s9", page_id, "0x0", "c1").unwrap_err().is_not_found());
        assert_eq!(store.spaces.require("s1").unwrap(), space);
    }

    #[test]
    fn test_add_page_appends() {
        let (store, service, _) = setup();
        let id = service.add_page("s1", "Second").unwrap();
        let stored = store.spaces.require("s1").unwrap();
        assert_eq!(stored.pages.len(), 2);
        assert_eq!(stored.pages[1].id, id);
        assert!(service.add_page("nope", "x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_space_unbinds_devices() {
        let (store, service, _) = setup();
        store.surface_devices.upsert(SurfaceDevice {
            id: "d1".to_string(),
            name: "Pad".to_string(),
            status: DeviceStatus::Offline,
            owner_id: None,
            uid: "d1".to_string(),
            adopted: true,
            space_id: Some("s1".to_string()),
            last_seen: Utc::now(),
        });

        service.delete_space("s1").unwrap();
        assert!(!store.spaces.contains("s1"));
        assert_eq!(store.surface_devices.require("d1").unwrap().space_id, None);
        assert!(service.delete_space("s1").unwrap_err().is_not_found());
    }
}
