use serde_json::{Map, Value};

use crate::error::Result;

mod http;
#[cfg(test)]
pub mod memory;

pub use http::FirebaseClient;

/// One ordered page of a node's immediate children.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: Map<String, Value>,
    /// Size of the response body, used for request-size statistics.
    pub bytes: usize,
}

/// The operations the backup and restore engine needs from the database.
///
/// Every call is a single request with no retry; callers see the first failure.
#[allow(async_fn_in_trait)]
pub trait Remote {
    /// Checks that the credentials can read the database.
    async fn authenticate(&self) -> Result<()>;

    /// Children of `path` ordered by key, starting at `start_at` inclusive,
    /// at most `limit` of them.
    async fn fetch_page(&self, path: &str, start_at: &str, limit: usize) -> Result<Page>;

    /// The value at `path` with children collapsed to `true` when it is a branch.
    async fn get_shallow(&self, path: &str) -> Result<Value>;

    async fn get(&self, path: &str) -> Result<Value>;

    async fn set(&self, path: &str, value: &Value) -> Result<()>;

    /// Raw text of the security rules, comments included.
    async fn get_rules(&self) -> Result<String>;

    async fn set_rules(&self, rules: &str) -> Result<()>;

    /// Ends the session. Nothing may be called afterwards.
    async fn close(&self) -> Result<()>;
}

/// Normalizes a response body into a child map.
///
/// Null and scalars have no children. Arrays are sequential integer keys.
pub fn children_of(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .filter(|(_, item)| !item.is_null())
            .map(|(idx, item)| (idx.to_string(), item))
            .collect(),
        _ => Map::new(),
    }
}
