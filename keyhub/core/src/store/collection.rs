//! Typed document collection with a change stream

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{HubError, HubResult};

/// Capacity of each collection's change stream
const CHANGE_CAPACITY: usize = 1024;

/// A document that can live in a [`Collection`]
pub trait Document: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection name, used for persistence and error messages
    const COLLECTION: &'static str;

    /// Document id
    fn id(&self) -> &str;
}

/// A change notification
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    /// A new document was written
    Inserted(T),
    /// An existing document was overwritten wholesale
    Replaced(T),
    /// An existing document was modified in place
    Updated {
        /// Document after the update
        doc: T,
        /// Serialized top-level field names whose values changed
        changed_fields: Vec<String>,
    },
    /// A document was removed
    Deleted {
        /// Id of the removed document
        id: String,
    },
}

impl<T: Document> Change<T> {
    /// Id of the affected document
    pub fn id(&self) -> &str {
        match self {
            Self::Inserted(doc) | Self::Replaced(doc) | Self::Updated { doc, .. } => doc.id(),
            Self::Deleted { id } => id,
        }
    }
}

/// What a [`Watcher`] yields
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<T> {
    /// A single change
    Change(Change<T>),
    /// Changes were missed; the consumer should rebuild from a full read
    Resync,
}

/// Subscription to a collection's change stream
pub struct Watcher<T> {
    rx: broadcast::Receiver<Change<T>>,
}

impl<T: Document> Watcher<T> {
    /// Wait for the next event; `None` once the collection is gone
    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        match self.rx.recv().await {
            Ok(change) => Some(WatchEvent::Change(change)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(
                    collection = T::COLLECTION,
                    missed,
                    "Change stream lagged, resynchronising"
                );
                Some(WatchEvent::Resync)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// An in-memory collection of documents of one type
///
/// Writes take the store-wide write gate so that they serialize with
/// transactions; reads never block on the gate.
pub struct Collection<T: Document> {
    docs: RwLock<HashMap<String, T>>,
    changes: broadcast::Sender<Change<T>>,
    gate: Arc<Mutex<()>>,
}

impl<T: Document> Collection<T> {
    pub(crate) fn new(gate: Arc<Mutex<()>>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            docs: RwLock::new(HashMap::new()),
            changes,
            gate,
        }
    }

    /// Collection name
    #[must_use]
    pub fn name(&self) -> &'static str {
        T::COLLECTION
    }

    /// Fetch a document by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<T> {
        self.docs.read().get(id).cloned()
    }

    /// Fetch a document or fail with `NotFound`
    pub fn require(&self, id: &str) -> HubResult<T> {
        self.get(id).ok_or_else(|| HubError::not_found(T::COLLECTION, id))
    }

    /// Whether a document with this id exists
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.docs.read().contains_key(id)
    }

    /// All documents, sorted by id
    #[must_use]
    pub fn list(&self) -> Vec<T> {
        let mut all: Vec<T> = self.docs.read().values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Documents matching a predicate, sorted by id
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let mut found: Vec<T> = self
            .docs
            .read()
            .values()
            .filter(|doc| pred(doc))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// Number of documents
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Whether the collection is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Subscribe to changes
    #[must_use]
    pub fn watch(&self) -> Watcher<T> {
        Watcher {
            rx: self.changes.subscribe(),
        }
    }

    /// Insert a new document
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a document with the same id is present.
    pub fn insert(&self, doc: T) -> HubResult<()> {
        let _gate = self.gate.lock();
        if self.contains(doc.id()) {
            return Err(HubError::AlreadyExists {
                kind: T::COLLECTION,
                id: doc.id().to_string(),
            });
        }
        self.apply_upsert(doc);
        Ok(())
    }

    /// Insert several documents in one write
    pub fn insert_many(&self, docs: Vec<T>) {
        let _gate = self.gate.lock();
        for doc in docs {
            self.apply_upsert(doc);
        }
    }

    /// Insert or replace a document
    pub fn upsert(&self, doc: T) {
        let _gate = self.gate.lock();
        self.apply_upsert(doc);
    }

    /// Modify a document in place; returns false if it does not exist
    pub fn update(&self, id: &str, f: impl FnOnce(&mut T)) -> bool {
        let _gate = self.gate.lock();
        let Some(mut doc) = self.get(id) else {
            return false;
        };
        f(&mut doc);
        self.apply_update(doc);
        true
    }

    /// Remove a document; returns false if it did not exist
    pub fn delete(&self, id: &str) -> bool {
        let _gate = self.gate.lock();
        self.apply_delete(id)
    }

    /// Remove every document matching a predicate; returns how many were removed
    pub fn delete_where(&self, pred: impl Fn(&T) -> bool) -> usize {
        let _gate = self.gate.lock();
        let ids: Vec<String> = self
            .docs
            .read()
            .values()
            .filter(|doc| pred(doc))
            .map(|doc| doc.id().to_string())
            .collect();
        ids.iter().filter(|id| self.apply_delete(id)).count()
    }

    // ===== Gate-free primitives (caller holds the gate) =====

    pub(crate) fn apply_upsert(&self, doc: T) {
        let previous = self.docs.write().insert(doc.id().to_string(), doc.clone());
        let change = if previous.is_some() {
            Change::Replaced(doc)
        } else {
            Change::Inserted(doc)
        };
        let _ = self.changes.send(change);
    }

    pub(crate) fn apply_update(&self, doc: T) {
        let previous = self.docs.write().insert(doc.id().to_string(), doc.clone());
        let changed_fields = match previous {
            Some(ref old) => changed_fields(old, &doc),
            None => Vec::new(),
        };
        if previous.is_none() {
            let _ = self.changes.send(Change::Inserted(doc));
        } else if !changed_fields.is_empty() {
            let _ = self.changes.send(Change::Updated {
                doc,
                changed_fields,
            });
        }
    }

    pub(crate) fn apply_delete(&self, id: &str) -> bool {
        let removed = self.docs.write().remove(id).is_some();
        if removed {
            let _ = self.changes.send(Change::Deleted { id: id.to_string() });
        }
        removed
    }

    // ===== Persistence =====

    pub(crate) fn load(&self, docs: Vec<T>) {
        let mut map = self.docs.write();
        for doc in docs {
            map.insert(doc.id().to_string(), doc);
        }
    }
}

/// Top-level serialized fields that differ between two documents
fn changed_fields<T: Serialize>(old: &T, new: &T) -> Vec<String> {
    let (Ok(Value::Object(old)), Ok(Value::Object(new))) =
        (serde_json::to_value(old), serde_json::to_value(new))
    else {
        return vec!["*".to_string()];
    };

    let mut fields: Vec<String> = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    fields.extend(
        old.keys()
            .filter(|key| !new.contains_key(*key))
            .cloned(),
    );
    fields.sort();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Note {
        id: String,
        body: String,
        render_hash: String,
    }

    impl Document for Note {
        const COLLECTION: &'static str = "notes";
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn note(id: &str, body: &str) -> Note {
        Note {
            id: id.to_string(),
            body: body.to_string(),
            render_hash: "h0".to_string(),
        }
    }

    fn collection() -> Collection<Note> {
        Collection::new(Arc::new(Mutex::new(())))
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let notes = collection();
        notes.insert(note("a", "x")).unwrap();
        let err = notes.insert(note("a", "y")).unwrap_err();
        assert!(matches!(err, HubError::AlreadyExists { .. }));
        assert_eq!(notes.get("a").unwrap().body, "x");
    }

    #[test]
    fn test_update_missing_returns_false() {
        let notes = collection();
        assert!(!notes.update("nope", |n| n.body.clear()));
    }

    #[test]
    fn test_delete_where_counts() {
        let notes = collection();
        notes.insert_many(vec![note("a", "keep"), note("b", "drop"), note("c", "drop")]);
        assert_eq!(notes.delete_where(|n| n.body == "drop"), 2);
        assert_eq!(notes.list().len(), 1);
    }

    #[tokio::test]
    async fn test_change_stream_reports_changed_fields() {
        let notes = collection();
        let mut watcher = notes.watch();

        notes.upsert(note("a", "x"));
        notes.upsert(note("a", "y"));
        notes.update("a", |n| n.render_hash = "h1".to_string());
        notes.update("a", |_| {});
        notes.delete("a");

        assert!(matches!(
            watcher.next().await,
            Some(WatchEvent::Change(Change::Inserted(_)))
        ));
        assert!(matches!(
            watcher.next().await,
            Some(WatchEvent::Change(Change::Replaced(_)))
        ));
        match watcher.next().await {
            Some(WatchEvent::Change(Change::Updated { changed_fields, .. })) => {
                assert_eq!(changed_fields, vec!["renderHash".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The no-op update emits nothing, so the next event is the delete
        assert_eq!(
            watcher.next().await,
            Some(WatchEvent::Change(Change::Deleted {
                id: "a".to_string()
            }))
        );
    }
}
