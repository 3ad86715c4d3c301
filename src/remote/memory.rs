//! In-memory database used by tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::{children_of, Page, Remote};
use crate::error::{FirebakError, Result};

#[derive(Debug, Default)]
pub struct MemoryRemote {
    tree: Mutex<Value>,
    rules: Mutex<String>,
    page_requests: AtomicUsize,
    writes: Mutex<Vec<(String, Value)>>,
    fail_writes_under: Mutex<Option<String>>,
    closed: Mutex<bool>,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn lookup<'a>(mut node: &'a Value, path: &str) -> Option<&'a Value> {
    for segment in segments(path) {
        node = node.get(segment)?;
    }
    Some(node)
}

impl MemoryRemote {
    pub fn new(tree: Value) -> Self {
        Self {
            tree: Mutex::new(tree),
            ..Self::default()
        }
    }

    pub fn with_rules(self, rules: &str) -> Self {
        *self.rules.lock().unwrap() = rules.to_string();
        self
    }

    /// Makes every write below `prefix` fail.
    pub fn fail_writes_under(&self, prefix: &str) {
        *self.fail_writes_under.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn value_at(&self, path: &str) -> Value {
        let tree = self.tree.lock().unwrap();
        lookup(&tree, path).cloned().unwrap_or(Value::Null)
    }

    pub fn rules(&self) -> String {
        self.rules.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl Remote for MemoryRemote {
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_page(&self, path: &str, start_at: &str, limit: usize) -> Result<Page> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        let node = self.value_at(path);
        let entries: Map<String, Value> = children_of(node)
            .into_iter()
            .filter(|(key, _)| key.as_str() >= start_at)
            .take(limit)
            .collect();
        let bytes = Value::Object(entries.clone()).to_string().len();
        Ok(Page { entries, bytes })
    }

    async fn get_shallow(&self, path: &str) -> Result<Value> {
        Ok(match self.value_at(path) {
            Value::Object(map) => Value::Object(
                map.keys()
                    .map(|key| (key.clone(), Value::Bool(true)))
                    .collect(),
            ),
            other => other,
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let value = self.value_at(path);
        // Let other writers run between this read and any write that follows.
        tokio::task::yield_now().await;
        Ok(value)
    }

    async fn set(&self, path: &str, value: &Value) -> Result<()> {
        tokio::task::yield_now().await;
        if let Some(prefix) = self.fail_writes_under.lock().unwrap().as_deref() {
            if path.starts_with(prefix) {
                return Err(FirebakError::network(path, "permission denied"));
            }
        }
        self.writes
            .lock()
            .unwrap()
            .push((path.to_string(), value.clone()));

        let mut tree = self.tree.lock().unwrap();
        let mut node = &mut *tree;
        for segment in segments(path) {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = node
                .as_object_mut()
                .unwrap()
                .entry(segment.to_string())
                .or_insert(Value::Null);
        }
        *node = value.clone();
        Ok(())
    }

    async fn get_rules(&self) -> Result<String> {
        Ok(self.rules())
    }

    async fn set_rules(&self, rules: &str) -> Result<()> {
        *self.rules.lock().unwrap() = rules.to_string();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}
