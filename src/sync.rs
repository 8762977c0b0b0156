//! Realtime sync layer.
//!
//! A path-addressed view of the store with list/value semantics. Every
//! successful write publishes the touched path on a broadcast change feed;
//! subscriptions are tasks that re-read their path whenever a change lands
//! at, under, or above it and hand the fresh snapshot to a callback.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use sqlx::{Pool, Postgres};
use tokio::{
    sync::{
        broadcast::{self, error::RecvError, error::TryRecvError},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::StoreError,
    memory::MemoryTree,
    store::PgStore,
    structure::Record,
};

const FEED_CAPACITY: usize = 256;

/// The fixed set of collections under the store root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorePath {
    Files,
    Doubts,
    MentorRequests,
    Logs,
    Syllabus,
    Settings,
    Subjects,
    Users,
    LostItems,
}

impl StorePath {
    pub const ALL: [StorePath; 9] = [
        StorePath::Files,
        StorePath::Doubts,
        StorePath::MentorRequests,
        StorePath::Logs,
        StorePath::Syllabus,
        StorePath::Settings,
        StorePath::Subjects,
        StorePath::Users,
        StorePath::LostItems,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            StorePath::Files => "files",
            StorePath::Doubts => "doubts",
            StorePath::MentorRequests => "mentor_requests",
            StorePath::Logs => "logs",
            StorePath::Syllabus => "syllabus",
            StorePath::Settings => "settings",
            StorePath::Subjects => "subjects",
            StorePath::Users => "users",
            StorePath::LostItems => "lost_items",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|path| path.as_str() == segment)
    }
}

pub enum Backend {
    Memory(MemoryTree),
    Postgres(PgStore),
}

impl Backend {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        match self {
            Backend::Memory(tree) => Ok(tree.read(path).await),
            Backend::Postgres(store) => store.read(path).await,
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError> {
        match self {
            Backend::Memory(tree) => Ok(tree.children(path).await),
            Backend::Postgres(store) => store.children(path).await,
        }
    }

    async fn insert(&self, path: &str, key: &str, value: Value) -> Result<(), StoreError> {
        match self {
            Backend::Memory(tree) => tree.insert(path, key, value).await,
            Backend::Postgres(store) => store.insert(path, key, value).await,
        }
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        match self {
            Backend::Memory(tree) => tree.set(path, value).await,
            Backend::Postgres(store) => store.set(path, value).await,
        }
    }

    async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        match self {
            Backend::Memory(tree) => tree.merge(path, fields).await,
            Backend::Postgres(store) => store.merge(path, fields).await,
        }
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        match self {
            Backend::Memory(tree) => tree.remove(path).await,
            Backend::Postgres(store) => store.remove(path).await,
        }
    }
}

struct Inner {
    backend: Backend,
    feed: broadcast::Sender<String>,
    root: String,
}

#[derive(Clone)]
pub struct SyncLayer {
    inner: Arc<Inner>,
}

/// A live listener. Dropping it releases the listener; [`unsubscribe`]
/// additionally waits until no callback can still be running.
///
/// [`unsubscribe`]: Subscription::unsubscribe
pub struct Subscription {
    path: String,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn unsubscribe(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(path = %self.path, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Whether a change at `changed` can alter what a subscriber on `watched` sees.
fn affects(watched: &str, changed: &str) -> bool {
    changed == watched
        || changed.starts_with(&format!("{watched}/"))
        || watched.starts_with(&format!("{changed}/"))
}

fn to_value<T: Serialize>(path: &str, record: &T) -> Result<Value, StoreError> {
    serde_json::to_value(record).map_err(|e| StoreError::WriteFailed {
        path: path.to_string(),
        detail: e.to_string(),
    })
}

fn to_fields<T: Serialize>(path: &str, fields: &T) -> Result<Map<String, Value>, StoreError> {
    match to_value(path, fields)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::WriteFailed {
            path: path.to_string(),
            detail: format!("partial update must be an object, got {other}"),
        }),
    }
}

fn to_records<T: DeserializeOwned>(path: &str, children: Vec<(String, Value)>) -> Vec<Record<T>> {
    children
        .into_iter()
        .filter_map(|(id, value)| match serde_json::from_value(value) {
            Ok(data) => Some(Record { id, data }),
            Err(e) => {
                warn!(path, id = %id, error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

impl SyncLayer {
    fn with_backend(backend: Backend, root: &str) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                backend,
                feed,
                root: root.trim_matches('/').to_string(),
            }),
        }
    }

    pub fn memory(root: &str) -> Self {
        Self::with_backend(Backend::Memory(MemoryTree::new()), root)
    }

    /// A layer over the Postgres node table that also hears writes made by
    /// other instances.
    pub async fn postgres(pool: Pool<Postgres>, root: &str) -> Result<Self, StoreError> {
        let instance = Uuid::now_v7().simple().to_string();
        let layer = Self::with_backend(Backend::Postgres(PgStore::new(pool, instance)), root);

        if let Backend::Postgres(store) = &layer.inner.backend {
            store.listen(layer.inner.feed.clone()).await?;
        }

        Ok(layer)
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    fn node(&self, path: StorePath) -> String {
        format!("{}/{}", self.inner.root, path.as_str())
    }

    fn child(&self, path: StorePath, id: &str) -> String {
        format!("{}/{}/{id}", self.inner.root, path.as_str())
    }

    fn publish(&self, changed: &str) {
        debug!(path = changed, "change published");
        let _ = self.inner.feed.send(changed.to_string());
    }

    /// Reject later writes at `path`. Only the in-memory backend has rules;
    /// on Postgres, privileges are managed in the database.
    pub async fn deny_writes(&self, path: StorePath) {
        match &self.inner.backend {
            Backend::Memory(tree) => tree.deny_writes(&self.node(path)).await,
            Backend::Postgres(_) => warn!(path = path.as_str(), "write rules are managed by the database"),
        }
    }

    pub async fn push<T: Serialize>(&self, path: StorePath, record: &T) -> Result<String, StoreError> {
        let node = self.node(path);
        let id = Uuid::now_v7().simple().to_string();
        let value = to_value(&node, record)?;

        self.inner.backend.insert(&node, &id, value).await.map_err(|e| {
            warn!(path = %node, error = %e, "push failed");
            e
        })?;

        self.publish(&format!("{node}/{id}"));
        Ok(id)
    }

    pub async fn set<T: Serialize>(&self, path: StorePath, record: &T) -> Result<(), StoreError> {
        let node = self.node(path);
        self.overwrite(&node, record).await
    }

    pub async fn set_child<T: Serialize>(&self, path: StorePath, id: &str, record: &T) -> Result<(), StoreError> {
        let node = self.child(path, id);
        self.overwrite(&node, record).await
    }

    async fn overwrite<T: Serialize>(&self, node: &str, record: &T) -> Result<(), StoreError> {
        let value = to_value(node, record)?;

        self.inner.backend.set(node, value).await.map_err(|e| {
            warn!(path = %node, error = %e, "set failed");
            e
        })?;

        self.publish(node);
        Ok(())
    }

    /// Merge `fields` into the child `id` without touching other fields.
    pub async fn update<T: Serialize>(&self, path: StorePath, id: &str, fields: &T) -> Result<(), StoreError> {
        let node = self.child(path, id);
        self.merge(&node, fields).await
    }

    /// Merge `fields` into the node itself, for singletons such as settings.
    pub async fn update_value<T: Serialize>(&self, path: StorePath, fields: &T) -> Result<(), StoreError> {
        let node = self.node(path);
        self.merge(&node, fields).await
    }

    async fn merge<T: Serialize>(&self, node: &str, fields: &T) -> Result<(), StoreError> {
        let fields = to_fields(node, fields)?;

        self.inner.backend.merge(node, fields).await.map_err(|e| {
            warn!(path = %node, error = %e, "update failed");
            e
        })?;

        self.publish(node);
        Ok(())
    }

    /// Removing a child that does not exist is a no-op.
    pub async fn remove(&self, path: StorePath, id: &str) -> Result<(), StoreError> {
        let node = self.child(path, id);

        self.inner.backend.remove(&node).await.map_err(|e| {
            warn!(path = %node, error = %e, "remove failed");
            e
        })?;

        self.publish(&node);
        Ok(())
    }

    /// Delete everything under the root. Irreversible; callers gate it.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let root = self.inner.root.clone();

        self.inner.backend.remove(&root).await.map_err(|e| {
            warn!(path = %root, error = %e, "clear failed");
            e
        })?;

        self.publish(&root);
        Ok(())
    }

    pub async fn list<T: DeserializeOwned>(&self, path: StorePath) -> Result<Vec<Record<T>>, StoreError> {
        let node = self.node(path);
        let children = self.inner.backend.children(&node).await?;
        Ok(to_records(&node, children))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: StorePath, id: &str) -> Result<Option<Record<T>>, StoreError> {
        let node = self.child(path, id);
        let Some(value) = self.inner.backend.read(&node).await? else {
            return Ok(None);
        };

        serde_json::from_value(value)
            .map(|data| Some(Record { id: id.to_string(), data }))
            .map_err(|e| StoreError::ReadFailed {
                path: node,
                detail: e.to_string(),
            })
    }

    pub async fn value<T: DeserializeOwned>(&self, path: StorePath) -> Result<Option<T>, StoreError> {
        let node = self.node(path);
        let Some(value) = self.inner.backend.read(&node).await? else {
            return Ok(None);
        };

        serde_json::from_value(value).map(Some).map_err(|e| StoreError::ReadFailed {
            path: node,
            detail: e.to_string(),
        })
    }

    /// Deliver every child of `path`, in insertion order, now and after each
    /// change. An absent node delivers an empty list.
    pub fn subscribe_to_list<T, F>(&self, path: StorePath, on_change: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(Vec<Record<T>>) + Send + 'static,
    {
        self.spawn_subscription(
            path,
            move |layer: SyncLayer| async move { layer.list::<T>(path).await }.boxed(),
            on_change,
        )
    }

    /// Deliver the node at `path`, now and after each change. An absent node
    /// delivers `None`.
    pub fn subscribe_to_value<T, F>(&self, path: StorePath, on_change: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: FnMut(Option<T>) + Send + 'static,
    {
        self.spawn_subscription(
            path,
            move |layer: SyncLayer| async move { layer.value::<T>(path).await }.boxed(),
            on_change,
        )
    }

    fn spawn_subscription<S, L, F>(&self, path: StorePath, load: L, mut deliver: F) -> Subscription
    where
        S: Send + 'static,
        L: Fn(SyncLayer) -> BoxFuture<'static, Result<S, StoreError>> + Send + 'static,
        F: FnMut(S) + Send + 'static,
    {
        let watched = self.node(path);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        // Subscribe before the first read so no change slips between them.
        let mut changes = self.inner.feed.subscribe();
        let layer = self.clone();
        let task_path = watched.clone();

        let task = tokio::spawn(async move {
            loop {
                match load(layer.clone()).await {
                    Ok(snapshot) => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                        deliver(snapshot);
                    }
                    Err(e) => warn!(path = %task_path, error = %e, "subscription read failed"),
                }

                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.changed() => return,

                        event = changes.recv() => match event {
                            Ok(changed) if affects(&task_path, &changed) => break,
                            Ok(_) => continue,
                            Err(RecvError::Lagged(skipped)) => {
                                debug!(path = %task_path, skipped, "subscriber lagged, resyncing");
                                break;
                            }
                            Err(RecvError::Closed) => return,
                        },
                    }
                }

                // Fold a burst of changes into one re-read.
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
        });

        debug!(path = %watched, "subscribed");

        Subscription {
            path: watched,
            shutdown_tx,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;
    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::structure::{Settings, Subject};

    const WAIT: Duration = Duration::from_secs(2);

    fn layer() -> SyncLayer {
        SyncLayer::memory("test_root")
    }

    fn subject(name: &str) -> Subject {
        Subject {
            name: name.to_string(),
        }
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Counter {
        title: String,
        download_count: u64,
    }

    #[test]
    fn change_relevance() {
        assert!(affects("r/files", "r/files"));
        assert!(affects("r/files", "r/files/abc"));
        assert!(affects("r/files", "r"));
        assert!(!affects("r/files", "r/filesystem"));
        assert!(!affects("r/files", "r/logs/abc"));
    }

    #[test]
    fn store_paths_round_trip_through_segments() {
        for path in StorePath::ALL {
            assert_eq!(StorePath::from_segment(path.as_str()), Some(path));
        }
        assert_eq!(StorePath::from_segment("passwords"), None);
    }

    #[tokio::test]
    async fn push_assigns_unique_ids() {
        let layer = layer();
        let a = layer.push(StorePath::Subjects, &subject("CS101")).await.unwrap();
        let b = layer.push(StorePath::Subjects, &subject("CS101")).await.unwrap();
        assert_ne!(a, b);

        let subjects = layer.list::<Subject>(StorePath::Subjects).await.unwrap();
        let ids: Vec<&str> = subjects.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let layer = layer();
        let id = layer
            .push(
                StorePath::Files,
                &Counter {
                    title: "Notes".to_string(),
                    download_count: 0,
                },
            )
            .await
            .unwrap();

        layer
            .update(StorePath::Files, &id, &serde_json::json!({ "downloadCount": 3 }))
            .await
            .unwrap();

        let record = layer.get::<Counter>(StorePath::Files, &id).await.unwrap().unwrap();
        assert_eq!(record.data.title, "Notes");
        assert_eq!(record.data.download_count, 3);
    }

    #[tokio::test]
    async fn non_object_update_is_rejected() {
        let layer = layer();
        let result = layer.update(StorePath::Files, "x", &5).await;
        assert!(matches!(result, Err(StoreError::WriteFailed { .. })));
    }

    #[tokio::test]
    async fn remove_twice_is_a_no_op() {
        let layer = layer();
        let id = layer.push(StorePath::Subjects, &subject("OS301")).await.unwrap();

        layer.remove(StorePath::Subjects, &id).await.unwrap();
        layer.remove(StorePath::Subjects, &id).await.unwrap();

        assert!(layer.list::<Subject>(StorePath::Subjects).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let layer = layer();
        layer.push(StorePath::Subjects, &subject("CS101")).await.unwrap();
        layer.set(StorePath::Settings, &Settings::default()).await.unwrap();

        layer.clear().await.unwrap();

        assert!(layer.list::<Subject>(StorePath::Subjects).await.unwrap().is_empty());
        assert_eq!(layer.value::<Settings>(StorePath::Settings).await.unwrap(), None);
    }

    #[tokio::test]
    async fn denied_writes_surface_as_write_denied() {
        let layer = layer();
        layer.deny_writes(StorePath::Files).await;

        let result = layer.push(StorePath::Files, &subject("x")).await;
        assert!(matches!(result, Err(StoreError::WriteDenied { .. })));
    }

    #[tokio::test]
    async fn list_subscription_tracks_changes_until_unsubscribed() {
        let layer = layer();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = layer.subscribe_to_list::<Subject, _>(StorePath::Subjects, move |list| {
            let _ = tx.send(list);
        });

        let initial = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(initial.is_empty());

        let id = layer.push(StorePath::Subjects, &subject("CS101")).await.unwrap();
        let after_push = loop {
            let list = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            if !list.is_empty() {
                break list;
            }
        };
        assert_eq!(after_push.len(), 1);
        assert_eq!(after_push[0].id, id);
        assert_eq!(after_push[0].data.name, "CS101");

        subscription.unsubscribe().await;
        layer.push(StorePath::Subjects, &subject("MATH202")).await.unwrap();

        // The callback (and the sender it owns) is gone once unsubscribe returns.
        while let Ok(Some(list)) = timeout(WAIT, rx.recv()).await {
            assert!(list.len() < 2, "delivery after unsubscribe");
        }
    }

    #[tokio::test]
    async fn unrelated_paths_do_not_trigger_delivery() {
        let layer = layer();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _subscription = layer.subscribe_to_list::<Subject, _>(StorePath::Subjects, move |list| {
            let _ = tx.send(list.len());
        });
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(0));

        layer.push(StorePath::Logs, &subject("noise")).await.unwrap();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn value_subscription_sees_settings() {
        let layer = layer();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription = layer.subscribe_to_value::<Settings, _>(StorePath::Settings, move |settings| {
            let _ = tx.send(settings);
        });
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(None));

        let settings = Settings {
            manual_review: false,
            ..Settings::default()
        };
        layer.set(StorePath::Settings, &settings).await.unwrap();

        let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered, Some(settings));

        drop(subscription);
    }

    #[tokio::test]
    async fn many_subscribers_share_a_path() {
        let layer = layer();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let _a = layer.subscribe_to_list::<Subject, _>(StorePath::Subjects, move |l| {
            let _ = tx_a.send(l.len());
        });
        let _b = layer.subscribe_to_list::<Subject, _>(StorePath::Subjects, move |l| {
            let _ = tx_b.send(l.len());
        });

        layer.push(StorePath::Subjects, &subject("CS101")).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let mut latest = 0;
            while latest != 1 {
                latest = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            }
        }
    }
}
