//! Surface Host
//!
//! One record per attached surface:
//!
//! ```text
//!   SurfaceRecord
//!   ├── queue     serial; every mutation of this surface runs here, in order
//!   └── state
//!       ├── adapter          live handle, or none once detached
//!       ├── space / page     current binding
//!       ├── controls         control id → { slots showing it, initial render sent }
//!       └── slots            slot id → control id
//! ```
//!
//! Render changes fan out to every record showing the control. Space changes
//! rebuild the bindings of every record showing the space. Input goes the
//! other way: slot → control → [`ControlRunner`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use super::adapter::{ClearState, SurfaceAdapter};
use crate::controls::ControlRunner;
use crate::error::{HubError, HubResult};
use crate::model::{ButtonStyle, ControlRender, DeviceStatus, SurfaceDevice, SurfaceSpace};
use crate::queue::WorkQueue;
use crate::store::{Change, Store, WatchEvent};

/// Identity of a surface being attached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Hub-wide device id
    pub id: String,
    /// Display name
    pub name: String,
    /// Hardware id as the bridge or driver reports it
    pub uid: String,
}

#[derive(Debug, Default)]
struct ControlSlots {
    slots: BTreeSet<String>,
    sent: bool,
}

#[derive(Debug, Default)]
struct SurfaceState {
    adapter: Option<SurfaceAdapter>,
    space_id: Option<String>,
    page_id: Option<String>,
    controls: HashMap<String, ControlSlots>,
    slots: HashMap<String, String>,
}

impl SurfaceState {
    fn clear_bindings(&mut self) {
        self.space_id = None;
        self.page_id = None;
        self.controls.clear();
        self.slots.clear();
    }

    fn shows_control(&self, control_id: &str) -> bool {
        self.controls.contains_key(control_id)
    }
}

struct SurfaceRecord {
    queue: WorkQueue,
    state: Mutex<SurfaceState>,
}

impl SurfaceRecord {
    fn new(device_id: &str) -> Self {
        Self {
            queue: WorkQueue::serial(format!("surface:{device_id}")),
            state: Mutex::new(SurfaceState::default()),
        }
    }

    fn is_idle(&self) -> bool {
        self.state.lock().adapter.is_none() && self.queue.pending() == 0
    }
}

struct HostInner {
    instance_id: String,
    store: Arc<Store>,
    runner: ControlRunner,
    surfaces: DashMap<String, Arc<SurfaceRecord>>,
    shutdown: watch::Sender<bool>,
}

/// Tracks attached surfaces and keeps them drawn
#[derive(Clone)]
pub struct SurfaceHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for SurfaceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHost")
            .field("instance_id", &self.inner.instance_id)
            .field("surfaces", &self.inner.surfaces.len())
            .finish()
    }
}

impl SurfaceHost {
    /// Create a host with a fresh instance id
    #[must_use]
    pub fn new(store: Arc<Store>, runner: ControlRunner) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HostInner {
                instance_id: uuid::Uuid::new_v4().to_string(),
                store,
                runner,
                surfaces: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// Id recorded as `ownerId` on devices this host attaches
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Follow render and space changes
    pub fn start(&self) {
        let host = self.clone();
        let mut renders = self.inner.store.control_renders.watch();
        let mut spaces = self.inner.store.spaces.watch();
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        event = renders.next() => match event {
                            Some(event) => host.on_render_event(event),
                            None => break,
                        },
                        event = spaces.next() => match event {
                            Some(event) => host.on_space_event(event),
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Surface watch stopped");
            }
            .instrument(tracing::info_span!("surface_host")),
        );
    }

    /// Stop following changes
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Ids of surfaces with a record, sorted
    #[must_use]
    pub fn connected_surfaces(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .surfaces
            .iter()
            .filter(|entry| entry.value().state.lock().adapter.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Control shown in a slot of an attached surface
    #[must_use]
    pub fn slot_control(&self, device_id: &str, slot_id: &str) -> Option<String> {
        let record = self.existing(device_id)?;
        let state = record.state.lock();
        state.slots.get(slot_id).cloned()
    }

    /// Wait until every surface queue is drained
    pub async fn wait_idle(&self) {
        let records: Vec<Arc<SurfaceRecord>> = self
            .inner
            .surfaces
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for record in records {
            record.queue.wait_idle().await;
        }
    }

    fn existing(&self, device_id: &str) -> Option<Arc<SurfaceRecord>> {
        self.inner
            .surfaces
            .get(device_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn require(&self, device_id: &str) -> HubResult<Arc<SurfaceRecord>> {
        self.existing(device_id)
            .ok_or_else(|| HubError::not_found("surface", device_id))
    }

    fn record(&self, device_id: &str) -> Arc<SurfaceRecord> {
        Arc::clone(
            self.inner
                .surfaces
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(SurfaceRecord::new(device_id)))
                .value(),
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Attach a surface and draw whatever its stored binding shows
    ///
    /// # Errors
    ///
    /// `Closed` once the host has shut down or if the surface queue is gone.
    pub async fn surface_connected(&self, info: DeviceInfo, adapter: SurfaceAdapter) -> HubResult<()> {
        if *self.inner.shutdown.borrow() {
            return Err(HubError::Closed("surface host".to_string()));
        }
        let record = self.record(&info.id);
        let inner = Arc::clone(&self.inner);
        let job_record = Arc::clone(&record);

        record
            .queue
            .run(async move {
                let store = &inner.store;
                let existing = store.surface_devices.get(&info.id);
                let (adopted, space_id) = existing
                    .map(|d| (d.adopted, d.space_id))
                    .unwrap_or((false, None));

                store.surface_devices.upsert(SurfaceDevice {
                    id: info.id.clone(),
                    name: info.name.clone(),
                    status: DeviceStatus::Ready,
                    owner_id: Some(inner.instance_id.clone()),
                    uid: info.uid.clone(),
                    adopted,
                    space_id: space_id.clone(),
                    last_seen: Utc::now(),
                });

                let mut state = job_record.state.lock();
                state.adapter = Some(adapter);
                setup(&inner, &info.id, &mut state, space_id);
                info!(device_id = %info.id, name = %info.name, "Surface connected");
            })
            .await
    }

    /// Rebuild a surface's bindings from a space's first page
    ///
    /// # Errors
    ///
    /// `NotFound` if the surface is not attached.
    pub async fn setup_surface_for_space(
        &self,
        device_id: &str,
        space_id: Option<String>,
    ) -> HubResult<()> {
        let record = self.require(device_id)?;
        self.queue_setup(&record, device_id, space_id).await
    }

    async fn queue_setup(
        &self,
        record: &Arc<SurfaceRecord>,
        device_id: &str,
        space_id: Option<String>,
    ) -> HubResult<()> {
        let inner = Arc::clone(&self.inner);
        let job_record = Arc::clone(record);
        let id = device_id.to_string();
        record
            .queue
            .run(async move {
                let mut state = job_record.state.lock();
                setup(&inner, &id, &mut state, space_id);
            })
            .await
    }

    /// Persist a device's space binding and redraw it if attached
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown device or space.
    pub async fn bind_space(&self, device_id: &str, space_id: Option<&str>) -> HubResult<()> {
        let store = &self.inner.store;
        if let Some(space_id) = space_id {
            store.spaces.require(space_id)?;
        }
        let bound = store.surface_devices.update(device_id, |device| {
            device.space_id = space_id.map(str::to_string);
        });
        if !bound {
            return Err(HubError::not_found("surface_devices", device_id));
        }

        if let Some(record) = self.existing(device_id) {
            self.queue_setup(&record, device_id, space_id.map(str::to_string))
                .await?;
        }
        Ok(())
    }

    /// Detach a surface; adopted devices go offline, others are forgotten
    ///
    /// The stored row is only touched while this host is its owner.
    ///
    /// # Errors
    ///
    /// `NotFound` if the surface is not attached.
    pub async fn surface_disconnected(&self, device_id: &str) -> HubResult<()> {
        let record = self.require(device_id)?;
        let inner = Arc::clone(&self.inner);
        let job_record = Arc::clone(&record);
        let id = device_id.to_string();

        record
            .queue
            .run(async move {
                {
                    let mut state = job_record.state.lock();
                    state.adapter = None;
                    state.clear_bindings();
                }

                let store = &inner.store;
                let owned = store
                    .surface_devices
                    .get(&id)
                    .filter(|d| d.owner_id.as_deref() == Some(inner.instance_id.as_str()));
                match owned {
                    Some(device) if device.adopted => {
                        store.surface_devices.update(&id, |d| {
                            d.status = DeviceStatus::Offline;
                            d.owner_id = None;
                            d.last_seen = Utc::now();
                        });
                        info!(device_id = %id, "Adopted surface offline");
                    }
                    Some(_) => {
                        store.surface_devices.delete(&id);
                        info!(device_id = %id, "Surface removed");
                    }
                    None => debug!(device_id = %id, "Surface owned elsewhere, row left alone"),
                }
            })
            .await?;

        self.inner
            .surfaces
            .remove_if(device_id, |_, record| record.is_idle());
        Ok(())
    }

    /// Forward a slot press to the control runner
    ///
    /// Slots with no control are ignored.
    ///
    /// # Errors
    ///
    /// `NotFound` if the surface is not attached, otherwise whatever the
    /// runner reports.
    pub fn surface_control_input(&self, device_id: &str, slot_id: &str, pressed: bool) -> HubResult<()> {
        let record = self.require(device_id)?;
        let control_id = record.state.lock().slots.get(slot_id).cloned();
        let Some(control_id) = control_id else {
            debug!(device_id, slot_id, "Input on unmapped slot");
            return Ok(());
        };
        self.inner.runner.press_control(&control_id, pressed)?;
        Ok(())
    }

    /// Keep a device's row while it is offline
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown device.
    pub fn adopt(&self, device_id: &str) -> HubResult<()> {
        let adopted = self
            .inner
            .store
            .surface_devices
            .update(device_id, |device| device.adopted = true);
        if adopted {
            Ok(())
        } else {
            Err(HubError::not_found("surface_devices", device_id))
        }
    }

    /// Set an attached surface's brightness
    ///
    /// # Errors
    ///
    /// `NotFound` if the surface is not attached.
    pub async fn set_brightness(&self, device_id: &str, percent: u8) -> HubResult<()> {
        let record = self.require(device_id)?;
        let job_record = Arc::clone(&record);
        let id = device_id.to_string();
        record
            .queue
            .run(async move {
                match &job_record.state.lock().adapter {
                    Some(adapter) => {
                        adapter.set_brightness(percent);
                        Ok(())
                    }
                    None => Err(HubError::not_found("surface", id)),
                }
            })
            .await?
    }

    // =========================================================================
    // Reactive paths
    // =========================================================================

    fn on_render_event(&self, event: WatchEvent<ControlRender>) {
        match event {
            WatchEvent::Change(
                Change::Inserted(render) | Change::Replaced(render) | Change::Updated { doc: render, .. },
            ) => {
                let render = Arc::new(render);
                for record in self.records_showing(&render.id) {
                    let render = Arc::clone(&render);
                    let job_record = Arc::clone(&record);
                    record.queue.submit(async move {
                        let mut state = job_record.state.lock();
                        push_render(&mut state, &render.id, &render.style, render.image.as_deref());
                    });
                }
            }
            WatchEvent::Change(Change::Deleted { id }) => {
                let blank = ButtonStyle::default();
                for record in self.records_showing(&id) {
                    let job_record = Arc::clone(&record);
                    let id = id.clone();
                    let blank = blank.clone();
                    record.queue.submit(async move {
                        let mut state = job_record.state.lock();
                        push_render(&mut state, &id, &blank, None);
                    });
                }
            }
            WatchEvent::Resync => self.resetup_where(|_, _| true),
        }
    }

    fn on_space_event(&self, event: WatchEvent<SurfaceSpace>) {
        match event {
            WatchEvent::Change(change) => {
                let space_id = change.id().to_string();
                self.resetup_where(|state, stored| {
                    state.space_id.as_deref() == Some(space_id.as_str())
                        || stored.as_deref() == Some(space_id.as_str())
                });
            }
            WatchEvent::Resync => self.resetup_where(|_, _| true),
        }
    }

    fn records_showing(&self, control_id: &str) -> Vec<Arc<SurfaceRecord>> {
        self.inner
            .surfaces
            .iter()
            .filter(|entry| entry.value().state.lock().shows_control(control_id))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Queue a rebuild from the stored binding for matching attached records
    fn resetup_where(&self, matches: impl Fn(&SurfaceState, &Option<String>) -> bool) {
        let targets: Vec<(String, Arc<SurfaceRecord>, Option<String>)> = self
            .inner
            .surfaces
            .iter()
            .filter_map(|entry| {
                let stored = self
                    .inner
                    .store
                    .surface_devices
                    .get(entry.key())
                    .and_then(|d| d.space_id);
                let state = entry.value().state.lock();
                (state.adapter.is_some() && matches(&state, &stored))
                    .then(|| (entry.key().clone(), Arc::clone(entry.value()), stored))
            })
            .collect();

        for (device_id, record, space_id) in targets {
            let inner = Arc::clone(&self.inner);
            let job_record = Arc::clone(&record);
            record.queue.submit(async move {
                let mut state = job_record.state.lock();
                setup(&inner, &device_id, &mut state, space_id);
            });
        }
    }
}

/// Clear the surface and rebuild both indexes, then push cached renders
fn setup(inner: &HostInner, device_id: &str, state: &mut SurfaceState, space_id: Option<String>) {
    state.clear_bindings();
    let Some(adapter) = state.adapter.clone() else {
        return;
    };
    let store = &inner.store;

    let space = match space_id {
        Some(id) => {
            let space = store.spaces.get(&id);
            if space.is_none() {
                warn!(device_id, space_id = %id, "Bound space is gone, clearing binding");
                store.surface_devices.update(device_id, |device| {
                    if device.space_id.as_deref() == Some(id.as_str()) {
                        device.space_id = None;
                    }
                });
            }
            space
        }
        None => None,
    };

    let Some(space) = space else {
        adapter.clear_surface(ClearState::Unbound);
        return;
    };

    adapter.clear_surface(ClearState::Blank);
    state.space_id = Some(space.id.clone());
    let Some(page) = space.first_page() else {
        return;
    };
    state.page_id = Some(page.id.clone());

    for (slot, control) in &page.slots {
        state.slots.insert(slot.clone(), control.clone());
        state
            .controls
            .entry(control.clone())
            .or_default()
            .slots
            .insert(slot.clone());
    }

    let mut drawn = 0usize;
    for (control_id, entry) in &mut state.controls {
        if entry.sent {
            continue;
        }
        if let Some(render) = store.control_renders.get(control_id) {
            for slot in &entry.slots {
                adapter.draw_control(slot, &render.style, render.image.as_deref());
                drawn += 1;
            }
            entry.sent = true;
        }
    }
    debug!(device_id, space_id = %space.id, page_id = %page.id, drawn, "Surface bound");
}

/// Draw one control into every slot showing it
fn push_render(state: &mut SurfaceState, control_id: &str, style: &ButtonStyle, image: Option<&str>) {
    let Some(adapter) = state.adapter.clone() else {
        return;
    };
    let Some(entry) = state.controls.get_mut(control_id) else {
        return;
    };
    for slot in &entry.slots {
        adapter.draw_control(slot, style, image);
    }
    entry.sent = image.is_some();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionEntry, ControlDefinition, SpaceShape};
    use crate::render::{RenderEngine, SolidRasterizer};
    use crate::surface::{SpaceService, SurfaceCall, VirtualSurface};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        store: Arc<Store>,
        host: SurfaceHost,
        spaces: SpaceService,
        page_id: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory());
        let host = SurfaceHost::new(Arc::clone(&store), ControlRunner::new(Arc::clone(&store)));
        host.start();
        let spaces = SpaceService::new(Arc::clone(&store));
        let space = spaces
            .create_space(
                "s1",
                "Main",
                SpaceShape {
                    columns: 8,
                    rows: 4,
                    kind: "grid".to_string(),
                },
            )
            .unwrap();
        Fixture {
            store,
            host,
            spaces,
            page_id: space.pages[0].id.clone(),
        }
    }

    fn device(id: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: "Pad".to_string(),
            uid: id.to_string(),
        }
    }

    fn render(id: &str, text: &str) -> ControlRender {
        ControlRender {
            id: id.to_string(),
            render_hash: "h".to_string(),
            image: Some("AAAA".to_string()),
            style: ButtonStyle::with_text(text),
        }
    }

    #[tokio::test]
    async fn test_unbound_surface_is_cleared_unbound() {
        let f = fixture();
        let surface = VirtualSurface::new();
        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(surface.clone()))
            .await
            .unwrap();

        assert_eq!(surface.calls(), vec![SurfaceCall::Clear(ClearState::Unbound)]);
        let row = f.store.surface_devices.require("d1").unwrap();
        assert_eq!(row.status, DeviceStatus::Ready);
        assert_eq!(row.owner_id.as_deref(), Some(f.host.instance_id()));
    }

    #[tokio::test]
    async fn test_bound_surface_draws_cached_renders() {
        let f = fixture();
        f.store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::with_text("Hi")));
        f.store.control_renders.upsert(render("c1", "Hi"));
        f.spaces.set_slot("s1", &f.page_id, "0x0", "c1").unwrap();
        f.spaces.set_slot("s1", &f.page_id, "1x0", "c1").unwrap();

        let surface = VirtualSurface::new();
        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(surface.clone()))
            .await
            .unwrap();
        f.host.bind_space("d1", Some("s1")).await.unwrap();

        let (style, image) = surface.last_draw("0x0").unwrap();
        assert_eq!(style.text, "Hi");
        assert_eq!(image.as_deref(), Some("AAAA"));
        assert!(surface.last_draw("1x0").is_some());
        assert_eq!(f.host.slot_control("d1", "0x0").as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_render_engine_pass_reaches_surface() {
        let f = fixture();
        f.store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::with_text("Hi")));
        f.spaces.set_slot("s1", &f.page_id, "0x0", "c1").unwrap();
        f.store.surface_devices.upsert(SurfaceDevice {
            id: "d1".to_string(),
            name: "Pad".to_string(),
            status: DeviceStatus::Offline,
            owner_id: None,
            uid: "d1".to_string(),
            adopted: true,
            space_id: Some("s1".to_string()),
            last_seen: Utc::now(),
        });

        let surface = VirtualSurface::new();
        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(surface.clone()))
            .await
            .unwrap();
        assert!(surface.last_draw("0x0").is_none());

        let engine = RenderEngine::new(Arc::clone(&f.store), Arc::new(SolidRasterizer), 4);
        engine.start();

        let drawn = surface
            .wait_for(Duration::from_secs(2), |calls| {
                calls.iter().any(|c| {
                    matches!(c, SurfaceCall::Draw { slot, style, image: Some(_) }
                        if slot == "0x0" && style.text == "Hi")
                })
            })
            .await;
        assert!(drawn);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_input_routes_to_runner() {
        let f = fixture();
        let mut control = ControlDefinition::button("c1", ButtonStyle::default());
        control.down_actions = vec![ActionEntry {
            id: "e1".to_string(),
            connection_id: "conn1".to_string(),
            action_id: "go".to_string(),
            options: serde_json::Value::Null,
            delay_ms: 0,
        }];
        f.store.controls.upsert(control);
        f.spaces.set_slot("s1", &f.page_id, "0x0", "c1").unwrap();

        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(VirtualSurface::new()))
            .await
            .unwrap();
        f.host.bind_space("d1", Some("s1")).await.unwrap();

        f.host.surface_control_input("d1", "0x0", true).unwrap();
        f.host.surface_control_input("d1", "7x7", true).unwrap();
        assert_eq!(f.store.work_tasks.len(), 1);
        assert!(f.store.control_status.get("c1").unwrap().pressed);

        assert!(f
            .host
            .surface_control_input("nobody", "0x0", true)
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_disconnect_deletes_or_marks_offline() {
        let f = fixture();
        f.host
            .surface_connected(device("eph"), SurfaceAdapter::Virtual(VirtualSurface::new()))
            .await
            .unwrap();
        f.host
            .surface_connected(device("kept"), SurfaceAdapter::Virtual(VirtualSurface::new()))
            .await
            .unwrap();
        f.host.adopt("kept").unwrap();

        f.host.surface_disconnected("eph").await.unwrap();
        f.host.surface_disconnected("kept").await.unwrap();

        assert!(!f.store.surface_devices.contains("eph"));
        let kept = f.store.surface_devices.require("kept").unwrap();
        assert_eq!(kept.status, DeviceStatus::Offline);
        assert_eq!(kept.owner_id, None);
        assert!(f.host.connected_surfaces().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_foreign_owned_row() {
        let f = fixture();
        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(VirtualSurface::new()))
            .await
            .unwrap();
        f.store
            .surface_devices
            .update("d1", |d| d.owner_id = Some("another-host".to_string()));

        f.host.surface_disconnected("d1").await.unwrap();
        let row = f.store.surface_devices.require("d1").unwrap();
        assert_eq!(row.owner_id.as_deref(), Some("another-host"));
    }

    #[tokio::test]
    async fn test_missing_bound_space_clears_binding() {
        let f = fixture();
        f.store.surface_devices.upsert(SurfaceDevice {
            id: "d1".to_string(),
            name: "Pad".to_string(),
            status: DeviceStatus::Offline,
            owner_id: None,
            uid: "d1".to_string(),
            adopted: true,
            space_id: Some("gone".to_string()),
            last_seen: Utc::now(),
        });

        let surface = VirtualSurface::new();
        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(surface.clone()))
            .await
            .unwrap();

        assert_eq!(f.store.surface_devices.require("d1").unwrap().space_id, None);
        assert_eq!(surface.calls(), vec![SurfaceCall::Clear(ClearState::Unbound)]);
    }

    #[tokio::test]
    async fn test_slot_edit_rebinds_attached_surface() {
        let f = fixture();
        f.store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::with_text("New")));
        f.store.control_renders.upsert(render("c1", "New"));

        let surface = VirtualSurface::new();
        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(surface.clone()))
            .await
            .unwrap();
        f.host.bind_space("d1", Some("s1")).await.unwrap();
        assert!(surface.last_draw("2x2").is_none());

        f.spaces.set_slot("s1", &f.page_id, "2x2", "c1").unwrap();
        assert!(
            surface
                .wait_for(Duration::from_secs(2), |calls| {
                    calls
                        .iter()
                        .any(|c| matches!(c, SurfaceCall::Draw { slot, .. } if slot == "2x2"))
                })
                .await
        );
    }

    #[tokio::test]
    async fn test_attach_refused_after_shutdown() {
        let f = fixture();
        f.host.shutdown();
        let err = f
            .host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(VirtualSurface::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Closed(_)));
        assert!(!f.store.surface_devices.contains("d1"));
        assert!(f.host.connected_surfaces().is_empty());
    }

    #[tokio::test]
    async fn test_brightness_requires_attachment() {
        let f = fixture();
        let surface = VirtualSurface::new();
        f.host
            .surface_connected(device("d1"), SurfaceAdapter::Virtual(surface.clone()))
            .await
            .unwrap();
        f.host.set_brightness("d1", 150).await.unwrap();
        assert!(surface.calls().contains(&SurfaceCall::Brightness(100)));
        assert!(f.host.set_brightness("d2", 10).await.unwrap_err().is_not_found());
    }
}
