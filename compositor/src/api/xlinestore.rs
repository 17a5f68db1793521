use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{CompositeResource, ResourceStatus, TopologyPayload};
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp};
use libtopology::keys::{parse_structure_key, structure_prefix};
use libtopology::writer::ResourceWriteClient;
use libwatch::with_xline::XlineKvClient;
use log::warn;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::config::XlineConfig;
use crate::reconcile::controller::ResourceStore;

const COMPOSITES_PREFIX: &str = "/registry/composites/";
const CONFIGMAPS_PREFIX: &str = "/registry/configmaps/";
const MEMBERS_PREFIX: &str = "/registry/composite-members/";

/// k:/registry/composites/<name> v:yaml of the composite resource
/// k:/registry/configmaps/<namespace>/<target> v:json topology payload
/// k:/registry/composite-members/<composite id> v:json array of namespaces
/// k:composite/<id>/structure/<namespace>/<attribute> v:structure fact
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
}

impl XlineStore {
    pub async fn new(config: &XlineConfig) -> Result<Self> {
        let opts = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                Some(ConnectOptions::default().with_user(user.clone(), pass.clone()))
            }
            _ => None,
        };
        let client = Client::connect(config.endpoints.clone(), opts)
            .await
            .context("failed to connect to xline")?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }

    /// Long-poll client sharing this store's connection.
    pub async fn kv_client(&self) -> XlineKvClient {
        XlineKvClient::from_client(self.client.read().await.clone())
    }

    pub async fn list_composites(&self) -> Result<Vec<CompositeResource>> {
        let mut client = self.client.write().await;
        let resp = client
            .get(COMPOSITES_PREFIX, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut composites = Vec::new();
        for kv in resp.kvs() {
            let key = String::from_utf8_lossy(kv.key());
            match serde_yaml::from_slice::<CompositeResource>(kv.value()) {
                Ok(resource) => composites.push(resource),
                Err(e) => warn!("Ignoring bad composite {key}: {e}"),
            }
        }
        Ok(composites)
    }

    pub async fn get_composite(&self, name: &str) -> Result<Option<CompositeResource>> {
        let key = format!("{COMPOSITES_PREFIX}{name}");
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(
                serde_yaml::from_slice(kv.value())
                    .with_context(|| format!("failed to parse composite {name}"))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn insert_composite(&self, resource: &CompositeResource) -> Result<()> {
        let key = format!("{COMPOSITES_PREFIX}{}", resource.metadata.name);
        let yaml = serde_yaml::to_string(resource)?;
        let mut client = self.client.write().await;
        client.put(key, yaml, Some(PutOptions::new())).await?;
        Ok(())
    }

    pub async fn update_composite_status(&self, name: &str, status: &ResourceStatus) -> Result<()> {
        let mut resource = self
            .get_composite(name)
            .await?
            .with_context(|| format!("composite {name} no longer exists"))?;
        resource.status = status.clone();
        self.insert_composite(&resource).await
    }

    pub async fn delete_composite(&self, name: &str) -> Result<()> {
        let key = format!("{COMPOSITES_PREFIX}{name}");
        let mut client = self.client.write().await;
        client.delete(key, None).await?;
        Ok(())
    }

    /// Writes all facts in one transaction.
    pub async fn put_facts(&self, facts: &[(String, String)]) -> Result<()> {
        let ops: Vec<TxnOp> = facts
            .iter()
            .map(|(k, v)| TxnOp::put(k.as_str(), v.as_str(), None))
            .collect();
        let mut client = self.client.write().await;
        client.txn(Txn::new().and_then(ops)).await?;
        Ok(())
    }

    /// Namespaces that have at least one structure fact under the composite.
    pub async fn structure_namespaces(&self, composite_id: &str) -> Result<BTreeSet<String>> {
        let mut client = self.client.write().await;
        let resp = client
            .get(
                structure_prefix(composite_id),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = std::str::from_utf8(kv.key()).ok()?;
                parse_structure_key(key).map(|k| k.namespace.to_string())
            })
            .collect())
    }

    pub async fn put_members(&self, composite_id: &str, members: &BTreeSet<String>) -> Result<()> {
        let key = format!("{MEMBERS_PREFIX}{composite_id}");
        let value = serde_json::to_string(members)?;
        let mut client = self.client.write().await;
        client.put(key, value, Some(PutOptions::new())).await?;
        Ok(())
    }

    pub async fn get_members(&self, composite_id: &str) -> Result<Option<BTreeSet<String>>> {
        let key = format!("{MEMBERS_PREFIX}{composite_id}");
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_json::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    pub async fn put_topology(
        &self,
        target_id: &str,
        namespace: &str,
        payload: &TopologyPayload,
    ) -> Result<()> {
        let key = format!("{CONFIGMAPS_PREFIX}{namespace}/{target_id}");
        let value = serde_json::to_string(payload)?;
        let mut client = self.client.write().await;
        client.put(key, value, Some(PutOptions::new())).await?;
        Ok(())
    }

    pub async fn get_topology(
        &self,
        target_id: &str,
        namespace: &str,
    ) -> Result<Option<TopologyPayload>> {
        let key = format!("{CONFIGMAPS_PREFIX}{namespace}/{target_id}");
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_json::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ResourceWriteClient for XlineStore {
    async fn apply(
        &self,
        target_id: &str,
        namespace: &str,
        payload: &TopologyPayload,
    ) -> Result<()> {
        self.put_topology(target_id, namespace, payload).await
    }
}

#[async_trait]
impl ResourceStore for XlineStore {
    async fn list(&self) -> Result<Vec<CompositeResource>> {
        self.list_composites().await
    }

    async fn update_status(&self, name: &str, status: &ResourceStatus) -> Result<()> {
        self.update_composite_status(name, status).await
    }
}
