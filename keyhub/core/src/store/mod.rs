//! Document Store
//!
//! The single source of truth for everything the hub persists. Each entity
//! type lives in its own [`Collection`] with a change stream; multi-step
//! writes that must be atomic go through [`Store::transaction`].
//!
//! # Write gate
//!
//! ```text
//!   collection.upsert() ──┐
//!   collection.delete() ──┼──▶ gate (one writer at a time) ──▶ apply + notify
//!   store.transaction() ──┘        held for the whole body
//! ```
//!
//! A transaction body stages its writes; they are applied only when the body
//! returns `Ok`, so an aborted transaction leaves no trace. Reads inside a
//! body see committed state only. Calling a gated collection write from
//! inside a transaction body deadlocks; use the [`Transaction`] methods.
//!
//! # Persistence
//!
//! [`Store::open`] with a data directory loads `<collection>.json` snapshots;
//! [`Store::flush`] writes them back (temp file + rename).

mod collection;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

pub use collection::{Change, Collection, Document, WatchEvent, Watcher};

use crate::error::HubResult;
use crate::model::{
    ActionDefinition, Connection, ControlDefinition, ControlRender, ControlStatus, SurfaceDevice,
    SurfaceSpace, WorkTask,
};

/// All collections the hub uses
pub struct Store {
    /// Module connections
    pub connections: Collection<Connection>,
    /// Control definitions
    pub controls: Collection<ControlDefinition>,
    /// Cached control renders
    pub control_renders: Collection<ControlRender>,
    /// Transient press state
    pub control_status: Collection<ControlStatus>,
    /// Pending module work
    pub work_tasks: Collection<WorkTask>,
    /// Surface spaces
    pub spaces: Collection<SurfaceSpace>,
    /// Known surface devices
    pub surface_devices: Collection<SurfaceDevice>,
    /// Module-declared actions
    pub action_definitions: Collection<ActionDefinition>,

    gate: Arc<Mutex<()>>,
    data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Create an empty, memory-only store
    #[must_use]
    pub fn in_memory() -> Self {
        let gate = Arc::new(Mutex::new(()));
        Self {
            connections: Collection::new(Arc::clone(&gate)),
            controls: Collection::new(Arc::clone(&gate)),
            control_renders: Collection::new(Arc::clone(&gate)),
            control_status: Collection::new(Arc::clone(&gate)),
            work_tasks: Collection::new(Arc::clone(&gate)),
            spaces: Collection::new(Arc::clone(&gate)),
            surface_devices: Collection::new(Arc::clone(&gate)),
            action_definitions: Collection::new(Arc::clone(&gate)),
            gate,
            data_dir: None,
        }
    }

    /// Open a store, loading snapshots from `data_dir` when given
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a snapshot
    /// exists but cannot be read or parsed.
    pub fn open(data_dir: Option<PathBuf>) -> HubResult<Self> {
        let mut store = Self::in_memory();
        let Some(dir) = data_dir else {
            return Ok(store);
        };

        fs::create_dir_all(&dir)?;
        load_snapshot(&dir, &store.connections)?;
        load_snapshot(&dir, &store.controls)?;
        load_snapshot(&dir, &store.control_renders)?;
        load_snapshot(&dir, &store.control_status)?;
        load_snapshot(&dir, &store.work_tasks)?;
        load_snapshot(&dir, &store.spaces)?;
        load_snapshot(&dir, &store.surface_devices)?;
        load_snapshot(&dir, &store.action_definitions)?;

        tracing::info!(path = %dir.display(), "Loaded store snapshots");
        store.data_dir = Some(dir);
        Ok(store)
    }

    /// Data directory, if persistent
    #[must_use]
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Write every collection to its snapshot file; no-op for memory-only stores
    ///
    /// # Errors
    ///
    /// Returns an error if a snapshot cannot be serialized or written.
    pub fn flush(&self) -> HubResult<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        // Hold the gate so the snapshot is a consistent cut
        let _gate = self.gate.lock();
        save_snapshot(dir, &self.connections)?;
        save_snapshot(dir, &self.controls)?;
        save_snapshot(dir, &self.control_renders)?;
        save_snapshot(dir, &self.control_status)?;
        save_snapshot(dir, &self.work_tasks)?;
        save_snapshot(dir, &self.spaces)?;
        save_snapshot(dir, &self.surface_devices)?;
        save_snapshot(dir, &self.action_definitions)?;
        tracing::debug!(path = %dir.display(), "Store flushed");
        Ok(())
    }

    /// Run `body` atomically against the store
    ///
    /// # Errors
    ///
    /// Returns whatever error `body` returns; in that case no staged write is
    /// applied.
    pub fn transaction<'s, R>(
        &'s self,
        body: impl FnOnce(&mut Transaction<'s>) -> HubResult<R>,
    ) -> HubResult<R> {
        let _gate = self.gate.lock();
        let mut tx = Transaction { staged: Vec::new() };
        let out = body(&mut tx)?;
        for op in tx.staged {
            op();
        }
        Ok(out)
    }
}

/// Staged writes of a running transaction
pub struct Transaction<'s> {
    staged: Vec<Box<dyn FnOnce() + 's>>,
}

impl<'s> Transaction<'s> {
    /// Read committed state
    pub fn get<T: Document>(&self, collection: &'s Collection<T>, id: &str) -> Option<T> {
        collection.get(id)
    }

    /// Committed documents matching `pred`; no other writer can change them
    /// before this transaction commits
    pub fn find<T: Document>(
        &self,
        collection: &'s Collection<T>,
        pred: impl Fn(&T) -> bool,
    ) -> Vec<T> {
        collection.find(pred)
    }

    /// Stage an insert-or-replace
    pub fn upsert<T: Document>(&mut self, collection: &'s Collection<T>, doc: T) {
        self.staged.push(Box::new(move || collection.apply_upsert(doc)));
    }

    /// Stage an in-place modification; returns the number of rows it will modify
    pub fn update<T: Document>(
        &mut self,
        collection: &'s Collection<T>,
        id: &str,
        f: impl FnOnce(&mut T),
    ) -> usize {
        let Some(mut doc) = collection.get(id) else {
            return 0;
        };
        f(&mut doc);
        self.staged.push(Box::new(move || collection.apply_update(doc)));
        1
    }

    /// Stage a delete; returns the number of rows it will remove
    pub fn delete<T: Document>(&mut self, collection: &'s Collection<T>, id: &str) -> usize {
        if !collection.contains(id) {
            return 0;
        }
        let id = id.to_string();
        self.staged.push(Box::new(move || {
            collection.apply_delete(&id);
        }));
        1
    }
}

fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn load_snapshot<T: Document>(dir: &Path, collection: &Collection<T>) -> HubResult<()> {
    let path = snapshot_path(dir, collection.name());
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read(&path)?;
    let docs: Vec<T> = serde_json::from_slice(&raw)?;
    tracing::debug!(collection = collection.name(), count = docs.len(), "Loaded snapshot");
    collection.load(docs);
    Ok(())
}

fn save_snapshot<T: Document>(dir: &Path, collection: &Collection<T>) -> HubResult<()> {
    let path = snapshot_path(dir, collection.name());
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(&collection.list())?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use crate::model::{ButtonStyle, ControlDefinition, ControlRender};
    use pretty_assertions::assert_eq;

    fn render_for(control: &ControlDefinition) -> ControlRender {
        ControlRender {
            id: control.id.clone(),
            render_hash: control.render_hash.clone(),
            image: None,
            style: control.style.clone(),
        }
    }

    #[test]
    fn test_transaction_commits_all_writes() {
        let store = Store::in_memory();
        let control = ControlDefinition::button("c1", ButtonStyle::with_text("Hi"));
        store.controls.insert(control.clone()).unwrap();

        store
            .transaction(|tx| {
                let touched = tx.update(&store.controls, "c1", |c| c.description = "x".into());
                assert_eq!(touched, 1);
                tx.upsert(&store.control_renders, render_for(&control));
                Ok(())
            })
            .unwrap();

        assert_eq!(store.controls.get("c1").unwrap().description, "x");
        assert!(store.control_renders.contains("c1"));
    }

    #[test]
    fn test_transaction_abort_discards_staged_writes() {
        let store = Store::in_memory();
        let control = ControlDefinition::button("c1", ButtonStyle::default());

        let result: HubResult<()> = store.transaction(|tx| {
            tx.upsert(&store.control_renders, render_for(&control));
            if tx.update(&store.controls, "c1", |_| {}) == 0 {
                return Err(HubError::TransactionAborted("control gone".into()));
            }
            Ok(())
        });

        assert!(matches!(result, Err(HubError::TransactionAborted(_))));
        assert!(store.control_renders.is_empty());
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(Some(dir.path().to_path_buf())).unwrap();
            store
                .controls
                .insert(ControlDefinition::button("c1", ButtonStyle::with_text("A")))
                .unwrap();
            store.flush().unwrap();
        }

        let reopened = Store::open(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(reopened.controls.get("c1").unwrap().style.text, "A");
        assert!(reopened.connections.is_empty());
    }

    #[test]
    fn test_memory_store_flush_is_noop() {
        let store = Store::in_memory();
        store.flush().unwrap();
        assert!(store.data_dir().is_none());
    }
}
