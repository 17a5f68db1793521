use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// One successful blocking-query response: the entries under the watched path
/// and the store index they were read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    index: u64,
    entries: Arc<BTreeMap<String, String>>,
}

impl Snapshot {
    pub fn new(index: u64, entries: BTreeMap<String, String>) -> Self {
        Self {
            index,
            entries: Arc::new(entries),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid utf-8 in kv entry: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for KvError {
    fn from(e: etcd_client::Error) -> Self {
        KvError::Xline(Box::new(e))
    }
}

/// Blocking-query access to a KV store.
///
/// Implementations may hold the request open for up to `wait` and return
/// early when anything under `path` changes past `since_index`. A response
/// that timed out without change carries an index that is not greater than
/// `since_index`.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn await_changes(
        &self,
        path: &str,
        since_index: u64,
        wait: Duration,
    ) -> Result<Snapshot, KvError>;
}
