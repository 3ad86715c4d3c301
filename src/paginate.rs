//! Cursor pagination over the immediate children of a subtree.
//!
//! Each request asks for up to `shard_size` children ordered by key starting
//! at the cursor, inclusive. A short page ends the walk. Because the start is
//! inclusive, the previous page's last key comes back as the first entry of
//! the next page; it is dropped so every child is yielded once.

use serde_json::{Map, Value};

use crate::error::{FirebakError, Result};
use crate::remote::Remote;
use crate::rules::BackupTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationCursor {
    pub start_at: String,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ShardPage {
    /// Children not yielded by an earlier page.
    pub entries: Map<String, Value>,
    /// Response size, boundary included.
    pub bytes: usize,
}

pub struct ShardedPaginator<'a, R> {
    remote: &'a R,
    path: &'a str,
    cursor: PaginationCursor,
    last_yielded: Option<String>,
    requests: usize,
    finished: bool,
}

impl<'a, R: Remote> ShardedPaginator<'a, R> {
    pub fn new(remote: &'a R, target: &'a BackupTarget) -> Self {
        Self {
            remote,
            path: &target.path,
            cursor: PaginationCursor {
                start_at: String::new(),
                page_size: target.shard_size,
            },
            last_yielded: None,
            requests: 0,
            finished: false,
        }
    }

    pub fn cursor(&self) -> &PaginationCursor {
        &self.cursor
    }

    pub fn requests(&self) -> usize {
        self.requests
    }

    /// Fetches the next page, or `None` once the final page was returned.
    pub async fn next_page(&mut self) -> Result<Option<ShardPage>> {
        if self.finished {
            return Ok(None);
        }

        let start_at = self.cursor.start_at.clone();
        let page = self
            .remote
            .fetch_page(self.path, &start_at, self.cursor.page_size)
            .await?;
        self.requests += 1;

        let returned = page.entries.len();
        // Response order is not trusted; the next cursor is the greatest key.
        let greatest = page.entries.keys().max().cloned();
        if returned >= self.cursor.page_size {
            match greatest {
                Some(key) if key > start_at => self.cursor.start_at = key,
                _ => {
                    return Err(FirebakError::PaginationStalled {
                        path: self.path.to_string(),
                        cursor: start_at,
                    })
                }
            }
        } else {
            self.finished = true;
        }

        let mut entries = page.entries;
        if let Some(boundary) = self.last_yielded.take() {
            entries.remove(&boundary);
        }
        self.last_yielded = (!self.finished).then(|| self.cursor.start_at.clone());

        tracing::debug!(
            path = self.path,
            start_at = %start_at,
            returned,
            new = entries.len(),
            "fetched shard page"
        );

        Ok(Some(ShardPage {
            entries,
            bytes: page.bytes,
        }))
    }
}
