//! In-process hierarchical store.
//!
//! The whole tree is one JSON object. Children keep insertion order
//! (`serde_json` is built with `preserve_order`), which is what list
//! subscribers see. Write-deny rules mimic the per-path rules a hosted
//! realtime database enforces.

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryTree {
    root: RwLock<Value>,
    denied: RwLock<Vec<String>>,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn covers(rule: &str, path: &str) -> bool {
    path == rule || path.starts_with(&format!("{rule}/"))
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(*segment))
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just made an object"),
    }
}

/// Walk to `segments`, creating empty objects on the way and replacing any
/// scalar that sits where an object is needed.
fn lookup_or_create<'a>(root: &'a mut Value, segments: &[&str]) -> &'a mut Map<String, Value> {
    segments.iter().fold(ensure_object(root), |map, segment| {
        ensure_object(
            map.entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
        )
    })
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every later write at or under `path`.
    pub async fn deny_writes(&self, path: &str) {
        debug!(path, "write rule added");
        self.denied.write().await.push(path.to_string());
    }

    async fn check_writable(&self, path: &str) -> Result<(), StoreError> {
        let denied = self.denied.read().await;
        if denied.iter().any(|rule| covers(rule, path)) {
            return Err(StoreError::WriteDenied {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    pub async fn read(&self, path: &str) -> Option<Value> {
        let root = self.root.read().await;
        lookup(&root, &segments(path))
            .filter(|value| !value.is_null())
            .cloned()
    }

    pub async fn children(&self, path: &str) -> Vec<(String, Value)> {
        let root = self.root.read().await;
        match lookup(&root, &segments(path)) {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub async fn insert(&self, path: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let child = format!("{path}/{key}");
        self.check_writable(&child).await?;

        let mut root = self.root.write().await;
        lookup_or_create(&mut root, &segments(path)).insert(key.to_string(), value);
        Ok(())
    }

    /// Overwrite the node at `path`. Writing `null` removes it.
    pub async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.check_writable(path).await?;
        if value.is_null() {
            self.detach(path).await;
            return Ok(());
        }

        let segments = segments(path);
        let mut root = self.root.write().await;
        match segments.split_last() {
            Some((last, parent)) => {
                lookup_or_create(&mut root, parent).insert(last.to_string(), value);
            }
            None => *root = value,
        }
        Ok(())
    }

    /// Shallow-merge `fields` into the object at `path`, creating it if absent.
    pub async fn merge(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.check_writable(path).await?;

        let mut root = self.root.write().await;
        let node = lookup_or_create(&mut root, &segments(path));
        for (key, value) in fields {
            if value.is_null() {
                node.shift_remove(&key);
            } else {
                node.insert(key, value);
            }
        }
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.check_writable(path).await?;
        self.detach(path).await;
        Ok(())
    }

    async fn detach(&self, path: &str) {
        let segments = segments(path);
        let mut root = self.root.write().await;
        match segments.split_last() {
            Some((last, parent)) => {
                let parent = parent
                    .iter()
                    .try_fold(&mut *root, |node, segment| node.as_object_mut()?.get_mut(*segment));
                if let Some(Value::Object(map)) = parent {
                    map.shift_remove(*last);
                }
            }
            None => *root = Value::Null,
        }
    }
}
