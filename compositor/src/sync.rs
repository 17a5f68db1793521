//! Snapshot → topology payload → destination store.

use std::sync::Arc;

use anyhow::anyhow;
use common::TopologyPayload;
use libtopology::{RetryingWriter, StructureParseError, transform};
use libwatch::{Snapshot, SnapshotSink};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::config::WriterConfig;

/// Sink to hand to the watch coordinator, paired with the receiving end.
pub fn snapshot_channel() -> (SnapshotSink, mpsc::UnboundedReceiver<Snapshot>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: SnapshotSink = Arc::new(move |snapshot: Snapshot| {
        tx.send(snapshot)
            .map_err(|_| anyhow!("topology sync pipeline has stopped"))
    });
    (sink, rx)
}

pub struct TopologySync {
    writer: RetryingWriter,
    target_id: String,
    cloud_provider: Option<String>,
    cloud_oidc_proxy_url: Option<String>,
}

impl TopologySync {
    pub fn new(writer: RetryingWriter, config: &WriterConfig) -> Self {
        Self {
            writer,
            target_id: config.target_id.clone(),
            cloud_provider: config.cloud_provider.clone(),
            cloud_oidc_proxy_url: config.cloud_oidc_proxy_url.clone(),
        }
    }

    pub fn build_payload(&self, snapshot: &Snapshot) -> Result<TopologyPayload, StructureParseError> {
        Ok(TopologyPayload {
            cloud_provider: self.cloud_provider.clone(),
            cloud_oidc_proxy_url: self.cloud_oidc_proxy_url.clone(),
            composite: transform(snapshot.iter())?,
        })
    }

    /// Transforms `snapshot` and queues the result for writing.
    ///
    /// On a parse error nothing is queued and the last written payload stays.
    pub fn handle(&self, snapshot: &Snapshot) -> Result<(), StructureParseError> {
        let payload = self.build_payload(snapshot)?;
        debug!(
            "queueing topology from index {} ({} keys) for {}/{}",
            snapshot.index(),
            snapshot.len(),
            self.writer.namespace(),
            self.target_id
        );
        self.writer.request_update(&self.target_id, &payload);
        Ok(())
    }

    /// Consumes snapshots until the channel closes or `token` is cancelled.
    /// Only the newest of several queued snapshots is processed.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Snapshot>, token: CancellationToken) {
        loop {
            let mut snapshot = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };
            while let Ok(newer) = rx.try_recv() {
                snapshot = newer;
            }
            if let Err(e) = self.handle(&snapshot) {
                warn!(
                    "skipping topology snapshot at index {}: {e}",
                    snapshot.index()
                );
            }
        }
        info!("topology sync stopped");
        self.writer.shutdown();
    }
}
