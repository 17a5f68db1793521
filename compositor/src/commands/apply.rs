use crate::api::xlinestore::XlineStore;
use anyhow::{Context, Result};
use common::CompositeResource;
use log::info;
use std::path::Path;

/// Stores the composite from `file`, keeping the status of an existing one.
pub async fn user_apply(file: &Path, xline_store: &XlineStore) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read composite from {}", file.display()))?;
    let mut resource: CompositeResource =
        serde_yaml::from_str(&content).context("Failed to parse composite YAML")?;
    resource
        .spec
        .validate()
        .with_context(|| format!("composite {} is invalid", resource.metadata.name))?;

    let name = resource.metadata.name.clone();
    match xline_store.get_composite(&name).await? {
        Some(existing) => {
            resource.status = existing.status;
            info!("[user_apply] updating composite {name}");
        }
        None => info!("[user_apply] creating composite {name}"),
    }
    xline_store.insert_composite(&resource).await?;
    println!("composite {name} applied");
    Ok(())
}
