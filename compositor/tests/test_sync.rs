use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{BaselineSpec, CompositeSpec, NamespaceRoles, TopologyPayload};
use compositor::protocol::config::WriterConfig;
use compositor::reconcile::registry::structure_facts;
use compositor::sync::{TopologySync, snapshot_channel};
use libtopology::keys::structure_ref_key;
use libtopology::{ResourceWriteClient, RetryingWriter, WriterPolicy};
use libwatch::{
    BackoffPolicy, KvClient, KvError, LongPollEngine, Snapshot, TopologyWatchCoordinator,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// In-memory blocking-query store: every write bumps a global index.
#[derive(Default)]
struct MemoryKv {
    data: Mutex<(u64, BTreeMap<String, String>)>,
    changed: Notify,
}

impl MemoryKv {
    fn put(&self, key: &str, value: &str) {
        let mut data = self.data.lock().unwrap();
        data.0 += 1;
        data.1.insert(key.to_string(), value.to_string());
        drop(data);
        self.changed.notify_waiters();
    }

    fn read(&self, prefix: &str) -> Snapshot {
        let data = self.data.lock().unwrap();
        let entries = data
            .1
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Snapshot::new(data.0, entries)
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn await_changes(
        &self,
        path: &str,
        since_index: u64,
        wait: Duration,
    ) -> Result<Snapshot, KvError> {
        let notified = self.changed.notified();
        let current = self.read(path);
        if since_index == 0 || current.index() > since_index {
            return Ok(current);
        }
        let _ = tokio::time::timeout(wait, notified).await;
        Ok(self.read(path))
    }
}

#[derive(Default)]
struct RecordingClient {
    applied: Mutex<Vec<(String, String, TopologyPayload)>>,
}

impl RecordingClient {
    fn applied(&self) -> Vec<(String, String, TopologyPayload)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceWriteClient for RecordingClient {
    async fn apply(
        &self,
        target_id: &str,
        namespace: &str,
        payload: &TopologyPayload,
    ) -> anyhow::Result<()> {
        self.applied.lock().unwrap().push((
            target_id.to_string(),
            namespace.to_string(),
            payload.clone(),
        ));
        Ok(())
    }
}

fn writer_config() -> WriterConfig {
    WriterConfig {
        target_id: "composite-structure".to_string(),
        namespace: "shop".to_string(),
        cloud_provider: Some("aws".to_string()),
        cloud_oidc_proxy_url: None,
    }
}

fn pipeline(client: &Arc<RecordingClient>) -> TopologySync {
    let writer = RetryingWriter::new(client.clone(), "shop", WriterPolicy::default());
    TopologySync::new(writer, &writer_config())
}

fn origin(ns: &str) -> NamespaceRoles {
    NamespaceRoles {
        origin: Some(ns.to_string()),
        ..Default::default()
    }
}

fn satellite_of_shop(ns: &str) -> CompositeSpec {
    CompositeSpec {
        origin_namespace: ns.to_string(),
        baseline: Some(BaselineSpec {
            origin_namespace: "shop".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn wait_for_applies(client: &RecordingClient, count: usize) {
    for _ in 0..200 {
        if client.applied().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} applies, got {:?}", client.applied());
}

#[tokio::test(start_paused = true)]
async fn test_registered_structure_flows_to_destination() {
    let kv = Arc::new(MemoryKv::default());
    for (key, value) in structure_facts(&satellite_of_shop("edge")) {
        kv.put(&key, &value);
    }

    let client = Arc::new(RecordingClient::default());
    let (sink, rx) = snapshot_channel();
    let token = CancellationToken::new();
    let sync_task = tokio::spawn(pipeline(&client).run(rx, token.clone()));
    let engine = LongPollEngine::new(kv.clone(), Duration::from_secs(60), Duration::from_secs(1));
    let coordinator = TopologyWatchCoordinator::new(
        engine,
        structure_ref_key("shop"),
        BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(5)).unwrap(),
        sink,
    );
    coordinator.start();

    wait_for_applies(&client, 1).await;
    assert_eq!(coordinator.active_prefix().as_deref(), Some("composite/shop/"));
    let (target, namespace, payload) = client.applied()[0].clone();
    assert_eq!(target, "composite-structure");
    assert_eq!(namespace, "shop");
    assert_eq!(payload.cloud_provider.as_deref(), Some("aws"));
    assert_eq!(payload.composite.baseline, Some(origin("shop")));
    assert_eq!(payload.composite.satellites, vec![origin("edge")]);

    for (key, value) in structure_facts(&satellite_of_shop("blog")) {
        kv.put(&key, &value);
    }
    wait_for_applies(&client, 2).await;
    let latest = client.applied().last().unwrap().2.clone();
    assert_eq!(latest.composite.satellites, vec![origin("blog"), origin("edge")]);

    coordinator.stop();
    token.cancel();
    sync_task.await.unwrap();
}

#[tokio::test]
async fn test_parse_error_writes_nothing() {
    let client = Arc::new(RecordingClient::default());
    let sync = pipeline(&client);
    let snapshot = Snapshot::new(
        7,
        [(
            "composite/shop/structure/shop/compositeRole".to_string(),
            "primary".to_string(),
        )]
        .into_iter()
        .collect(),
    );

    let err = sync.handle(&snapshot).unwrap_err();
    assert_eq!(err.field, "compositeRole");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.applied().is_empty());
}

#[tokio::test]
async fn test_queued_snapshots_collapse_to_newest() {
    let client = Arc::new(RecordingClient::default());
    let (sink, rx) = snapshot_channel();
    for (index, ns) in [(1, "a"), (2, "b"), (3, "c")] {
        let entries = [(
            format!("composite/{ns}/structure/{ns}/compositeRole"),
            "baseline".to_string(),
        )]
        .into_iter()
        .collect();
        sink(Snapshot::new(index, entries)).unwrap();
    }
    let token = CancellationToken::new();
    let sync_task = tokio::spawn(pipeline(&client).run(rx, token.clone()));

    wait_for_applies(&client, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let applied = client.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].2.composite.baseline, Some(origin("c")));

    token.cancel();
    sync_task.await.unwrap();
}

#[tokio::test]
async fn test_sink_fails_once_pipeline_is_gone() {
    let (sink, rx) = snapshot_channel();
    drop(rx);
    assert!(sink(Snapshot::new(1, BTreeMap::new())).is_err());
}
