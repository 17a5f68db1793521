use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libwatch::{
    BackoffPolicy, KvClient, KvError, LongPollEngine, SessionState, Snapshot, SnapshotCallback,
    SnapshotSink, TopologyWatchCoordinator, WatchOptions,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

const REF_KEY: &str = "config/shop/application/composite/structureRef";

type Reply = Result<Snapshot, KvError>;

/// KV client whose replies are pushed per path by the test. Unknown paths, or
/// paths with no queued reply, block until a reply arrives.
#[derive(Default)]
struct ScriptedKv {
    feeds: Mutex<HashMap<String, Arc<tokio::sync::Mutex<UnboundedReceiver<Reply>>>>>,
    senders: Mutex<HashMap<String, UnboundedSender<Reply>>>,
    calls: Mutex<Vec<(String, u64)>>,
}

impl ScriptedKv {
    fn feed(&self, path: &str) -> UnboundedSender<Reply> {
        let mut senders = self.senders.lock().unwrap();
        if let Some(tx) = senders.get(path) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        senders.insert(path.to_string(), tx.clone());
        self.feeds
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::new(tokio::sync::Mutex::new(rx)));
        tx
    }

    fn calls_for(&self, path: &str) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, i)| *i)
            .collect()
    }
}

#[async_trait]
impl KvClient for ScriptedKv {
    async fn await_changes(&self, path: &str, since: u64, _wait: Duration) -> Reply {
        self.calls.lock().unwrap().push((path.to_string(), since));
        let feed = self.feeds.lock().unwrap().get(path).cloned();
        match feed {
            Some(feed) => match feed.lock().await.recv().await {
                Some(reply) => reply,
                None => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }
}

fn snap(index: u64, entries: &[(&str, &str)]) -> Reply {
    let map: BTreeMap<String, String> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(Snapshot::new(index, map))
}

fn failure() -> Reply {
    Err(KvError::Unavailable("connection refused".into()))
}

fn recording_callback() -> (SnapshotCallback, UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let cb: SnapshotCallback = Arc::new(move |s: &Snapshot| {
        tx.send(s.index())?;
        Ok(())
    });
    (cb, rx)
}

async fn drain(rx: &mut UnboundedReceiver<u64>) -> Vec<u64> {
    let mut out = Vec::new();
    while let Ok(Some(i)) = timeout(Duration::from_secs(1), rx.recv()).await {
        out.push(i);
    }
    out
}

fn engine(kv: &Arc<ScriptedKv>) -> LongPollEngine {
    LongPollEngine::new(
        kv.clone(),
        Duration::from_secs(540),
        Duration::from_secs(5),
    )
}

#[tokio::test(start_paused = true)]
async fn test_delivers_only_increasing_indices() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("composite/a/");
    for i in [5, 5, 7, 6, 9] {
        tx.send(snap(i, &[])).unwrap();
    }
    let (cb, mut rx) = recording_callback();
    let session = engine(&kv).watch("composite/a/", WatchOptions::default(), cb);

    assert_eq!(drain(&mut rx).await, vec![5, 7, 9]);
    assert_eq!(session.last_seen_index(), 9);
    assert_eq!(kv.calls_for("composite/a/"), vec![0, 5, 5, 7, 7, 9]);
}

#[tokio::test(start_paused = true)]
async fn test_equal_index_not_redelivered_without_fire_on_first() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("p");
    for i in [0, 3, 3] {
        tx.send(snap(i, &[])).unwrap();
    }
    let (cb, mut rx) = recording_callback();
    let _session = engine(&kv).watch("p", WatchOptions::default(), cb);
    assert_eq!(drain(&mut rx).await, vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_fire_on_first_success_delivers_unchanged_index() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("p");
    tx.send(snap(0, &[])).unwrap();
    tx.send(snap(0, &[])).unwrap();
    tx.send(snap(2, &[])).unwrap();
    let (cb, mut rx) = recording_callback();
    let options = WatchOptions {
        fire_on_first_success: true,
        backoff: None,
    };
    let _session = engine(&kv).watch("p", options, cb);
    assert_eq!(drain(&mut rx).await, vec![0, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_error_keeps_index_and_waits_error_delay() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("p");
    tx.send(snap(4, &[])).unwrap();
    tx.send(failure()).unwrap();
    let (cb, mut rx) = recording_callback();
    let _session = engine(&kv).watch("p", WatchOptions::default(), cb);

    assert_eq!(rx.recv().await, Some(4));
    tokio::task::yield_now().await;
    // the failed poll schedules the retry five seconds out
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(kv.calls_for("p"), vec![0, 4]);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(kv.calls_for("p"), vec![0, 4, 4]);

    tx.send(snap(8, &[])).unwrap();
    assert_eq!(rx.recv().await, Some(8));
}

#[tokio::test(start_paused = true)]
async fn test_errors_use_backoff_when_configured() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("p");
    for _ in 0..3 {
        tx.send(failure()).unwrap();
    }
    let (cb, _rx) = recording_callback();
    let options = WatchOptions {
        fire_on_first_success: false,
        backoff: Some(
            BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(60)).unwrap(),
        ),
    };
    let _session = engine(&kv).watch("p", options, cb);

    // retries land at 8.5..11.5s and then 22.95..37.95s
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(kv.calls_for("p").len(), 1);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(kv.calls_for("p").len(), 2);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(kv.calls_for("p").len(), 2);
    tokio::time::sleep(Duration::from_secs(18)).await;
    assert_eq!(kv.calls_for("p").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_callback_error_does_not_stop_polling() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("p");
    tx.send(snap(1, &[])).unwrap();
    tx.send(snap(2, &[])).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cb: SnapshotCallback = {
        let seen = seen.clone();
        Arc::new(move |s: &Snapshot| {
            seen.lock().unwrap().push(s.index());
            anyhow::bail!("downstream broken")
        })
    };
    let _session = engine(&kv).watch("p", WatchOptions::default(), cb);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(kv.calls_for("p"), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_discards_in_flight_response() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("p");
    let (cb, mut rx) = recording_callback();
    let session = engine(&kv).watch("p", WatchOptions::default(), cb);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.state(), SessionState::Polling);
    assert_eq!(kv.calls_for("p"), vec![0]);

    session.cancel();
    session.cancel();
    let _ = tx.send(snap(3, &[]));

    assert!(drain(&mut rx).await.is_empty());
    assert_eq!(kv.calls_for("p"), vec![0]);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(session.last_seen_index(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_delay_stops_loop() {
    let kv = Arc::new(ScriptedKv::default());
    let tx = kv.feed("p");
    tx.send(failure()).unwrap();
    let (cb, _rx) = recording_callback();
    let session = engine(&kv).watch("p", WatchOptions::default(), cb);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(session.state(), SessionState::Scheduled);
    session.cancel();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(kv.calls_for("p"), vec![0]);
}

struct Harness {
    kv: Arc<ScriptedKv>,
    coordinator: TopologyWatchCoordinator,
    delivered: UnboundedReceiver<Snapshot>,
}

fn harness() -> Harness {
    let kv = Arc::new(ScriptedKv::default());
    let (tx, delivered) = mpsc::unbounded_channel();
    let sink: SnapshotSink = Arc::new(move |s: Snapshot| {
        tx.send(s)?;
        Ok(())
    });
    let coordinator = TopologyWatchCoordinator::new(
        engine(&kv),
        REF_KEY,
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)).unwrap(),
        sink,
    );
    Harness {
        kv,
        coordinator,
        delivered,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_follows_pointer() {
    let mut h = harness();
    let reference = h.kv.feed(REF_KEY);
    let data_a = h.kv.feed("composite/a/");

    reference.send(snap(1, &[(REF_KEY, "composite/a/")])).unwrap();
    data_a
        .send(snap(7, &[("composite/a/structure/a/compositeRole", "baseline")]))
        .unwrap();
    h.coordinator.start();
    settle().await;

    assert_eq!(h.coordinator.active_prefix().as_deref(), Some("composite/a/"));
    let s = h.delivered.recv().await.unwrap();
    assert_eq!(s.index(), 7);
    assert_eq!(
        s.get("composite/a/structure/a/compositeRole"),
        Some("baseline")
    );
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_same_prefix_does_not_restart() {
    let h = harness();
    let reference = h.kv.feed(REF_KEY);
    h.kv.feed("composite/a/");

    reference.send(snap(1, &[(REF_KEY, "composite/a/")])).unwrap();
    h.coordinator.start();
    settle().await;
    reference.send(snap(2, &[(REF_KEY, " composite/a/ ")])).unwrap();
    settle().await;

    assert_eq!(h.kv.calls_for("composite/a/"), vec![0]);
    assert_eq!(h.coordinator.active_prefix().as_deref(), Some("composite/a/"));
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_switches_and_pauses() {
    let mut h = harness();
    let reference = h.kv.feed(REF_KEY);
    let data_a = h.kv.feed("composite/a/");
    let data_b = h.kv.feed("composite/b/");

    reference.send(snap(1, &[(REF_KEY, "composite/a/")])).unwrap();
    h.coordinator.start();
    settle().await;

    reference.send(snap(2, &[(REF_KEY, "composite/b/")])).unwrap();
    settle().await;
    assert_eq!(h.coordinator.active_prefix().as_deref(), Some("composite/b/"));
    assert_eq!(h.kv.calls_for("composite/b/"), vec![0]);

    // the closed watch on a must not deliver anything anymore
    let _ = data_a.send(snap(9, &[]));
    data_b.send(snap(4, &[])).unwrap();
    settle().await;
    assert_eq!(h.delivered.recv().await.unwrap().index(), 4);
    assert!(h.delivered.try_recv().is_err());

    reference.send(snap(3, &[(REF_KEY, "   ")])).unwrap();
    settle().await;
    assert_eq!(h.coordinator.active_prefix(), None);
    let _ = data_b.send(snap(5, &[]));
    settle().await;
    assert!(h.delivered.try_recv().is_err());
    assert!(h.coordinator.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_start_is_idempotent_and_stop_ignores_late_events() {
    let mut h = harness();
    let reference = h.kv.feed(REF_KEY);
    let data_a = h.kv.feed("composite/a/");

    h.coordinator.start();
    h.coordinator.start();
    settle().await;
    assert_eq!(h.kv.calls_for(REF_KEY), vec![0]);

    h.coordinator.stop();
    assert!(!h.coordinator.is_running());
    let _ = reference.send(snap(1, &[(REF_KEY, "composite/a/")]));
    settle().await;
    assert_eq!(h.coordinator.active_prefix(), None);
    assert!(h.kv.calls_for("composite/a/").is_empty());

    h.coordinator.start();
    reference.send(snap(2, &[(REF_KEY, "composite/a/")])).unwrap();
    data_a.send(snap(3, &[])).unwrap();
    settle().await;
    assert_eq!(h.coordinator.active_prefix().as_deref(), Some("composite/a/"));
    assert_eq!(h.delivered.recv().await.unwrap().index(), 3);
}
