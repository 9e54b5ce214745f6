//! Typed appliance operations. Each method marshals one (or a short
//! sequence of) RPC transport calls and translates the reply, following the
//! teacher's delegate-then-translate service style.

use crate::error::{ApplianceError, Result};
use rpc_transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::instrument;

pub const MANAGED_BY_PROPERTY: &str = "managed-by";
pub const CSI_NAME_PROPERTY: &str = "csi.io/name";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetHandle {
    pub path: String,
    pub capacity_bytes: u64,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareHandle {
    pub id: String,
    pub export_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemHandle {
    pub nqn: String,
    pub namespace_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHandle {
    pub iqn: String,
    pub lun: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub id: String,
    pub source_path: String,
    pub size_bytes: u64,
    pub ready_to_use: bool,
}

/// Facade over the appliance's dataset/zvol/share/target/snapshot/clone API.
/// Holds the shared `Transport` handle; cheap to clone.
#[derive(Clone)]
pub struct ApplianceApi {
    transport: Transport,
    driver_id: String,
}

impl ApplianceApi {
    pub fn new(transport: Transport, driver_id: impl Into<String>) -> Self {
        Self {
            transport,
            driver_id: driver_id.into(),
        }
    }

    fn managed_properties(&self, csi_name: &str) -> HashMap<String, String> {
        let mut props = HashMap::new();
        props.insert(MANAGED_BY_PROPERTY.to_string(), self.driver_id.clone());
        props.insert(CSI_NAME_PROPERTY.to_string(), csi_name.to_string());
        props
    }

    #[instrument(level = "debug", skip(self, properties), err)]
    pub async fn create_dataset(
        &self,
        path: &str,
        csi_name: &str,
        capacity_bytes: u64,
        properties: &HashMap<String, String>,
    ) -> Result<DatasetHandle> {
        let mut props = self.managed_properties(csi_name);
        props.extend(properties.clone());
        self.transport
            .call(
                "dataset.create",
                Some(json!({ "path": path, "properties": props })),
            )
            .await
            .map_err(ApplianceError::from)?;
        Ok(DatasetHandle {
            path: path.to_string(),
            capacity_bytes,
            properties: props,
        })
    }

    #[instrument(level = "debug", skip(self, properties), err)]
    pub async fn create_zvol(
        &self,
        path: &str,
        csi_name: &str,
        capacity_bytes: u64,
        properties: &HashMap<String, String>,
    ) -> Result<DatasetHandle> {
        let mut props = self.managed_properties(csi_name);
        props.extend(properties.clone());
        self.transport
            .call(
                "zvol.create",
                Some(json!({
                    "path": path,
                    "volsize": capacity_bytes,
                    "properties": props,
                })),
            )
            .await
            .map_err(ApplianceError::from)?;
        Ok(DatasetHandle {
            path: path.to_string(),
            capacity_bytes,
            properties: props,
        })
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn extend(&self, path: &str, new_capacity_bytes: u64) -> Result<()> {
        self.transport
            .call(
                "zvol.extend",
                Some(json!({ "path": path, "volsize": new_capacity_bytes })),
            )
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self, properties), err)]
    pub async fn set_properties(
        &self,
        path: &str,
        properties: &HashMap<String, String>,
    ) -> Result<()> {
        for key in properties.keys() {
            if key == MANAGED_BY_PROPERTY || key == CSI_NAME_PROPERTY {
                return Err(ApplianceError::InvalidArgument {
                    message: format!("property '{}' is reserved", key),
                });
            }
        }
        self.transport
            .call(
                "dataset.set_properties",
                Some(json!({ "path": path, "properties": properties })),
            )
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.transport
            .call(
                "dataset.delete",
                Some(json!({ "path": path, "recursive": recursive })),
            )
            .await
            .map_err(ApplianceError::from)
    }

    /// Strips the `managed-by` property instead of deleting, so another
    /// cluster may later adopt the entity (`mark_adoptable`).
    #[instrument(level = "debug", skip(self), err)]
    pub async fn mark_adoptable(&self, path: &str) -> Result<()> {
        self.transport
            .call(
                "dataset.remove_property",
                Some(json!({ "path": path, "property": MANAGED_BY_PROPERTY })),
            )
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn adopt(&self, path: &str, csi_name: &str) -> Result<DatasetHandle> {
        let props = self.managed_properties(csi_name);
        self.transport
            .call::<serde_json::Value>(
                "dataset.set_properties",
                Some(json!({ "path": path, "properties": props })),
            )
            .await
            .map_err(ApplianceError::from)?;
        self.find_by_path(path).await?.ok_or_else(|| ApplianceError::NotFound {
            kind: "dataset".into(),
            name: path.to_string(),
        })
    }

    /// Only entities carrying our `managed-by` marker are ever returned:
    /// callers must never touch an entity they didn't create or adopt.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn find_by_csi_name(&self, csi_name: &str) -> Result<Option<DatasetHandle>> {
        let found: Option<DatasetHandle> = self
            .transport
            .call(
                "dataset.query",
                Some(json!({
                    "properties": {
                        MANAGED_BY_PROPERTY: self.driver_id,
                        CSI_NAME_PROPERTY: csi_name,
                    }
                })),
            )
            .await
            .map_err(ApplianceError::from)?;
        Ok(found)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn find_by_path(&self, path: &str) -> Result<Option<DatasetHandle>> {
        let found: Option<DatasetHandle> = self
            .transport
            .call("dataset.get", Some(json!({ "path": path })))
            .await
            .map_err(ApplianceError::from)?;
        Ok(found)
    }

    /// All datasets/zvols carrying this driver's `managed-by` marker, for the
    /// operator CLI's `summary` command.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_managed(&self) -> Result<Vec<DatasetHandle>> {
        let found: Vec<DatasetHandle> = self
            .transport
            .call(
                "dataset.query",
                Some(json!({ "properties": { MANAGED_BY_PROPERTY: self.driver_id } })),
            )
            .await
            .map_err(ApplianceError::from)?;
        Ok(found)
    }

    /// Clones created from a snapshot of `path` that have not been promoted
    /// (and so still depend on it). Used to enforce that a dataset with live
    /// dependents can't be deleted out from under them.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn list_dependent_clones(&self, path: &str) -> Result<Vec<DatasetHandle>> {
        let found: Vec<DatasetHandle> = self
            .transport
            .call("dataset.list_dependents", Some(json!({ "path": path })))
            .await
            .map_err(ApplianceError::from)?;
        Ok(found)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn create_nfs_share(&self, path: &str, options: &HashMap<String, String>) -> Result<ShareHandle> {
        self.transport
            .call("nfs.share_create", Some(json!({ "path": path, "options": options })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn set_share_enabled(&self, share_id: &str, enabled: bool) -> Result<()> {
        let method = if enabled { "nfs.share_enable" } else { "nfs.share_disable" };
        self.transport
            .call(method, Some(json!({ "id": share_id })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete_nfs_share(&self, share_id: &str) -> Result<()> {
        self.transport
            .call("nfs.share_delete", Some(json!({ "id": share_id })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn create_nvmf_subsystem(&self, nqn: &str, path: &str, port: u16) -> Result<SubsystemHandle> {
        self.transport
            .call(
                "nvmf.subsystem_create",
                Some(json!({ "nqn": nqn, "port": port })),
            )
            .await
            .map_err(ApplianceError::from)?;
        self.add_nvmf_namespace(nqn, path).await
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn add_nvmf_namespace(&self, nqn: &str, path: &str) -> Result<SubsystemHandle> {
        self.transport
            .call(
                "nvmf.namespace_add",
                Some(json!({ "nqn": nqn, "path": path })),
            )
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete_nvmf_subsystem(&self, nqn: &str) -> Result<()> {
        self.transport
            .call("nvmf.subsystem_delete", Some(json!({ "nqn": nqn })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn create_iscsi_target(&self, iqn: &str, port: u16) -> Result<TargetHandle> {
        self.transport
            .call("iscsi.target_create", Some(json!({ "iqn": iqn, "port": port })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn link_extent(&self, iqn: &str, path: &str) -> Result<TargetHandle> {
        self.transport
            .call("iscsi.extent_link", Some(json!({ "iqn": iqn, "path": path })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete_iscsi_target(&self, iqn: &str) -> Result<()> {
        self.transport
            .call("iscsi.target_delete", Some(json!({ "iqn": iqn })))
            .await
            .map_err(ApplianceError::from)
    }

    /// Attached snapshots are near-instant copy-on-write references;
    /// detached snapshots are full copies under `parent_dataset`.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn create_snapshot(
        &self,
        source_path: &str,
        csi_name: &str,
        detached_parent_dataset: Option<&str>,
    ) -> Result<SnapshotHandle> {
        let mut props = self.managed_properties(csi_name);
        props.insert("source".to_string(), source_path.to_string());
        self.transport
            .call(
                "snapshot.create",
                Some(json!({
                    "source_path": source_path,
                    "detached_parent_dataset": detached_parent_dataset,
                    "properties": props,
                })),
            )
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.transport
            .call("snapshot.delete", Some(json!({ "id": snapshot_id })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn rollback_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.transport
            .call("snapshot.rollback", Some(json!({ "id": snapshot_id })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn create_clone(
        &self,
        source_snapshot_or_volume: &str,
        target_path: &str,
        csi_name: &str,
    ) -> Result<DatasetHandle> {
        let props = self.managed_properties(csi_name);
        self.transport
            .call_long_running(
                "clone.create",
                Some(json!({
                    "source": source_snapshot_or_volume,
                    "target_path": target_path,
                    "properties": props,
                })),
            )
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn promote_clone(&self, path: &str) -> Result<()> {
        self.transport
            .call("clone.promote", Some(json!({ "path": path })))
            .await
            .map_err(ApplianceError::from)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn create_encryption_key(
        &self,
        path: &str,
        algorithm: &str,
        generate_key: bool,
        passphrase: Option<&str>,
    ) -> Result<()> {
        self.transport
            .call(
                "encryption.create",
                Some(json!({
                    "path": path,
                    "algorithm": algorithm,
                    "generate_key": generate_key,
                    "passphrase": passphrase,
                })),
            )
            .await
            .map_err(ApplianceError::from)
    }
}
