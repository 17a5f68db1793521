pub mod api;
pub mod cli;
pub mod commands;
pub mod protocol;
pub mod reconcile;
pub mod sync;

use std::sync::Arc;

use anyhow::Result;
use libtopology::keys::structure_ref_key;
use libtopology::{RetryingWriter, WriterPolicy};
use libwatch::{KvClient, LongPollEngine, TopologyWatchCoordinator};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::api::xlinestore::XlineStore;
use crate::protocol::config::Config;
use crate::reconcile::{DownstreamNotifier, ReconciliationStepMachine};
use crate::reconcile::controller::ReconcileController;
use crate::reconcile::registry::{MembershipNotifier, XlineStructureRegistry};
use crate::sync::{TopologySync, snapshot_channel};

/// Runs the controller and the topology sync until `token` is cancelled.
pub async fn run(cfg: Config, token: CancellationToken) -> Result<()> {
    let xline_store = Arc::new(XlineStore::new(&cfg.xline_config).await?);

    let kv: Arc<dyn KvClient> = Arc::new(xline_store.kv_client().await);
    let engine = LongPollEngine::new(kv, cfg.watch.wait(), cfg.watch.error_delay());
    let (sink, rx) = snapshot_channel();
    let coordinator = TopologyWatchCoordinator::new(
        engine,
        structure_ref_key(&cfg.watch.namespace),
        cfg.watch.backoff()?,
        sink,
    );

    let writer = RetryingWriter::new(
        xline_store.clone(),
        cfg.writer.namespace.clone(),
        WriterPolicy::default(),
    );
    let pipeline = TopologySync::new(writer, &cfg.writer);
    let sync_task = tokio::spawn(pipeline.run(rx, token.clone()));

    let machine = ReconciliationStepMachine::new(
        Arc::new(XlineStructureRegistry::new(
            xline_store.clone(),
            cfg.reconcile.integration_enabled,
        )),
        vec![
            Arc::new(MembershipNotifier::new(xline_store.clone())) as Arc<dyn DownstreamNotifier>,
        ],
    );
    let controller = ReconcileController::new(
        xline_store.clone(),
        machine,
        cfg.reconcile.interval(),
        cfg.reconcile.backoff()?,
    );
    let controller_task = tokio::spawn(controller.run(token.clone()));

    info!(
        "watching {} for namespace {}",
        coordinator.reference_key(),
        cfg.watch.namespace
    );
    coordinator.start();

    token.cancelled().await;
    coordinator.stop();

    match controller_task.await {
        Ok(Err(e)) => error!("reconcile controller failed: {e:#}"),
        Err(e) => error!("reconcile controller task panicked: {e}"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = sync_task.await {
        error!("topology sync task panicked: {e}");
    }
    info!("compositor stopped");
    Ok(())
}
