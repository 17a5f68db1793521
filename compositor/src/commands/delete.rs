use crate::api::xlinestore::XlineStore;
use anyhow::{Result, bail};
use log::info;

pub async fn user_delete(name: &str, xline_store: &XlineStore) -> Result<()> {
    if xline_store.get_composite(name).await?.is_none() {
        bail!("composite {name} not found");
    }
    xline_store.delete_composite(name).await?;
    info!("[user_delete] deleted composite {name}");
    println!("composite {name} deleted");
    Ok(())
}
