//! Render Engine
//!
//! Keeps [`ControlRender`] in step with [`ControlDefinition`], memoized by
//! `renderHash`.
//!
//! ```text
//!   controls watch ─┬─ Inserted / Replaced ──────────────▶ job
//!                   ├─ Updated (renderHash changed) ─────▶ job
//!                   ├─ Deleted ──▶ delete render
//!                   └─ Resync ──▶ job for every control, drop orphans
//!
//!   job: hash matches cached render? ── yes ──▶ done
//!          │ no
//!          ▼
//!        rasterize ─▶ base64 ─▶ transaction { touch control (0 rows ⇒ abort); upsert render }
//! ```
//!
//! The touch write inside the commit transaction means a control deleted
//! while its job was running never leaves a render behind.

pub mod raster;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

pub use raster::{Rasterizer, SolidRasterizer, IMAGE_SIZE};

use crate::error::{HubError, HubResult};
use crate::model::{ControlDefinition, ControlRender};
use crate::queue::WorkQueue;
use crate::store::{Change, Store, WatchEvent};

/// Field whose change invalidates a render
const RENDER_HASH_FIELD: &str = "renderHash";

/// What a render job did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderOutcome {
    /// A new image was committed
    Rendered,
    /// The cached render already matched
    Cached,
    /// The control no longer exists
    Missing,
}

struct EngineInner {
    store: Arc<Store>,
    rasterizer: Arc<dyn Rasterizer>,
    queue: WorkQueue,
    shutdown: watch::Sender<bool>,
}

/// Reactive, cached control renderer
#[derive(Clone)]
pub struct RenderEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderEngine")
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

impl RenderEngine {
    /// Create an engine running at most `concurrency` jobs at once
    #[must_use]
    pub fn new(store: Arc<Store>, rasterizer: Arc<dyn Rasterizer>, concurrency: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                store,
                rasterizer,
                queue: WorkQueue::new("render", concurrency),
                shutdown,
            }),
        }
    }

    /// Follow the control collection and render anything stale
    pub fn start(&self) {
        let engine = self.clone();
        let mut watcher = self.inner.store.controls.watch();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        event = watcher.next() => match event {
                            Some(event) => engine.on_event(event),
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Render watch stopped");
            }
            .instrument(tracing::info_span!("render_engine")),
        );
        self.render_all();
    }

    /// Stop following changes; queued jobs still finish
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    fn on_event(&self, event: WatchEvent<ControlDefinition>) {
        match event {
            WatchEvent::Change(Change::Inserted(control) | Change::Replaced(control)) => {
                self.enqueue(&control.id);
            }
            WatchEvent::Change(Change::Updated {
                doc,
                changed_fields,
            }) => {
                if changed_fields.iter().any(|f| f == RENDER_HASH_FIELD) {
                    self.enqueue(&doc.id);
                }
            }
            WatchEvent::Change(Change::Deleted { id }) => {
                if self.inner.store.control_renders.delete(&id) {
                    debug!(control_id = %id, "Render removed");
                }
            }
            WatchEvent::Resync => {
                let store = &self.inner.store;
                let orphans = store
                    .control_renders
                    .delete_where(|render| !store.controls.contains(&render.id));
                if orphans > 0 {
                    info!(orphans, "Removed orphan renders");
                }
                self.render_all();
            }
        }
    }

    /// Queue a job for every control
    pub fn render_all(&self) {
        let controls = self.inner.store.controls.list();
        debug!(count = controls.len(), "Render pass");
        for control in controls {
            self.enqueue(&control.id);
        }
    }

    /// Queue a render job
    pub fn enqueue(&self, control_id: &str) {
        let inner = Arc::clone(&self.inner);
        let id = control_id.to_string();
        self.inner.queue.submit(async move {
            if let Err(e) = render_control(&inner.store, inner.rasterizer.as_ref(), &id) {
                match e {
                    HubError::TransactionAborted(_) => {
                        debug!(control_id = %id, "Control vanished during render");
                    }
                    other => warn!(control_id = %id, error = %other, "Render failed"),
                }
            }
        });
    }

    /// Render through the queue and wait for the outcome
    ///
    /// # Errors
    ///
    /// `TransactionAborted` if the control was deleted mid-job, `Closed` if
    /// the queue is gone.
    pub async fn render_now(&self, control_id: &str) -> HubResult<RenderOutcome> {
        let inner = Arc::clone(&self.inner);
        let id = control_id.to_string();
        self.inner
            .queue
            .run(async move { render_control(&inner.store, inner.rasterizer.as_ref(), &id) })
            .await?
    }

    /// Wait until every queued job has finished
    pub async fn wait_idle(&self) {
        self.inner.queue.wait_idle().await;
    }
}

/// One render job
///
/// # Errors
///
/// `TransactionAborted` when the control disappears before the commit.
pub fn render_control(
    store: &Store,
    rasterizer: &dyn Rasterizer,
    control_id: &str,
) -> HubResult<RenderOutcome> {
    let Some(control) = store.controls.get(control_id) else {
        return Ok(RenderOutcome::Missing);
    };
    if store
        .control_renders
        .get(control_id)
        .is_some_and(|render| render.render_hash == control.render_hash)
    {
        return Ok(RenderOutcome::Cached);
    }

    let image = BASE64.encode(rasterizer.render(control.control_type, &control.style));
    let render = ControlRender {
        id: control.id.clone(),
        render_hash: control.render_hash.clone(),
        image: Some(image),
        style: control.style.clone(),
    };

    store.transaction(|tx| {
        let touched = tx.update(&store.controls, control_id, |c| c.touched_at = Utc::now());
        if touched == 0 {
            return Err(HubError::TransactionAborted(format!(
                "control {control_id} deleted during render"
            )));
        }
        tx.upsert(&store.control_renders, render);
        Ok(())
    })?;

    debug!(control_id, hash = %control.render_hash, "Rendered");
    Ok(RenderOutcome::Rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ButtonStyle, ControlType};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts calls and can delete the control mid-render
    #[derive(Default)]
    struct Probe {
        calls: AtomicUsize,
        delete_from: Option<Arc<Store>>,
    }

    impl Rasterizer for Probe {
        fn render(&self, control_type: ControlType, style: &ButtonStyle) -> Vec<u8> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(store) = &self.delete_from {
                store.controls.delete_where(|_| true);
            }
            SolidRasterizer.render(control_type, style)
        }
    }

    #[test]
    fn test_unchanged_hash_keeps_image() {
        let store = Store::in_memory();
        let probe = Probe::default();
        store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::with_text("Hi")));

        assert_eq!(render_control(&store, &probe, "c1").unwrap(), RenderOutcome::Rendered);
        let first = store.control_renders.require("c1").unwrap();

        assert_eq!(render_control(&store, &probe, "c1").unwrap(), RenderOutcome::Cached);
        let second = store.control_renders.require("c1").unwrap();

        assert_eq!(first.image, second.image);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.style.text, "Hi");
    }

    #[test]
    fn test_delete_during_render_leaves_no_orphan() {
        let store = Arc::new(Store::in_memory());
        store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::default()));
        let probe = Probe {
            calls: AtomicUsize::new(0),
            delete_from: Some(Arc::clone(&store)),
        };

        let err = render_control(&store, &probe, "c1").unwrap_err();
        assert!(matches!(err, HubError::TransactionAborted(_)));
        assert!(store.control_renders.is_empty());
    }

    #[test]
    fn test_missing_control() {
        let store = Store::in_memory();
        assert_eq!(
            render_control(&store, &SolidRasterizer, "nope").unwrap(),
            RenderOutcome::Missing
        );
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_engine_follows_control_changes() {
        let store = Arc::new(Store::in_memory());
        store
            .controls
            .upsert(ControlDefinition::button("early", ButtonStyle::default()));

        let engine = RenderEngine::new(Arc::clone(&store), Arc::new(SolidRasterizer), 4);
        engine.start();
        engine.wait_idle().await;
        assert!(store.control_renders.contains("early"));

        // Restyle ⇒ new render with the new hash
        store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::with_text("A")));
        assert!(eventually(|| store.control_renders.contains("c1")).await);
        store.controls.update("c1", |c| c.set_style(ButtonStyle::with_text("B")));
        let expected = store.controls.require("c1").unwrap().render_hash;
        assert!(
            eventually(|| store
                .control_renders
                .get("c1")
                .is_some_and(|r| r.render_hash == expected))
            .await
        );

        // Delete ⇒ render removed
        store.controls.delete("c1");
        assert!(eventually(|| !store.control_renders.contains("c1")).await);

        engine.shutdown();
    }

    #[tokio::test]
    async fn test_render_now_reports_outcome() {
        let store = Arc::new(Store::in_memory());
        store
            .controls
            .upsert(ControlDefinition::button("c1", ButtonStyle::default()));
        let engine = RenderEngine::new(Arc::clone(&store), Arc::new(SolidRasterizer), 2);

        assert_eq!(engine.render_now("c1").await.unwrap(), RenderOutcome::Rendered);
        assert_eq!(engine.render_now("c1").await.unwrap(), RenderOutcome::Cached);
    }
}
