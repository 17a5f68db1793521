use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, WatchOptions, WatchStream};
use log::{debug, warn};

use crate::kv::{KvClient, KvError, Snapshot};

/// Blocking-query emulation over xline/etcd.
///
/// Indices are store revisions. A poll from index 0 reads the prefix
/// immediately; any other poll holds a prefix watch starting after the given
/// revision for up to `wait` and re-reads the prefix once something changed.
#[derive(Clone)]
pub struct XlineKvClient {
    client: Client,
}

impl XlineKvClient {
    pub async fn connect(
        endpoints: &[String],
        options: Option<ConnectOptions>,
    ) -> Result<Self, KvError> {
        let client = Client::connect(endpoints, options).await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn read_prefix(&self, path: &str) -> Result<(u64, BTreeMap<String, String>), KvError> {
        // clone per request so a held long-poll never blocks other sessions
        let mut client = self.client.clone();
        let resp = client
            .get(path, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let mut entries = BTreeMap::new();
        for kv in resp.kvs() {
            let key = String::from_utf8(kv.key().to_vec())?;
            let value = String::from_utf8(kv.value().to_vec())?;
            entries.insert(key, value);
        }
        Ok((u64::try_from(revision).unwrap_or(0), entries))
    }
}

#[async_trait]
impl KvClient for XlineKvClient {
    async fn await_changes(
        &self,
        path: &str,
        since_index: u64,
        wait: Duration,
    ) -> Result<Snapshot, KvError> {
        if since_index == 0 {
            let (revision, entries) = self.read_prefix(path).await?;
            return Ok(Snapshot::new(revision, entries));
        }

        let start = i64::try_from(since_index.saturating_add(1)).unwrap_or(i64::MAX);
        let opts = WatchOptions::new().with_prefix().with_start_revision(start);
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client.watch(path, Some(opts)).await?;
        let outcome = tokio::time::timeout(wait, wait_for_change(&mut stream)).await;
        if let Err(e) = watcher.cancel().await {
            debug!("failed to cancel watch on {path}: {e}");
        }

        match outcome {
            Ok(Ok(())) => {
                let (revision, entries) = self.read_prefix(path).await?;
                Ok(Snapshot::new(revision, entries))
            }
            Ok(Err(e)) => Err(e),
            // nothing changed within the wait window
            Err(_) => {
                let (_, entries) = self.read_prefix(path).await?;
                Ok(Snapshot::new(since_index, entries))
            }
        }
    }
}

async fn wait_for_change(stream: &mut WatchStream) -> Result<(), KvError> {
    while let Some(resp) = stream.message().await? {
        if resp.canceled() {
            if resp.compact_revision() > 0 {
                warn!(
                    "watch start revision compacted (compact revision {}), re-reading",
                    resp.compact_revision()
                );
                return Ok(());
            }
            return Err(KvError::Unavailable("watch canceled by server".to_string()));
        }
        if !resp.events().is_empty() {
            return Ok(());
        }
    }
    Err(KvError::Unavailable("watch stream closed".to_string()))
}
