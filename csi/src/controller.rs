//! CSI Controller service: volume and snapshot lifecycle against the
//! appliance facade.
//!
//! Every mutating RPC first acquires the lock for its fingerprint (the
//! requested name on `CreateVolume`, the volume/snapshot id everywhere else)
//! from a process-lifetime lock map, following the registry pattern of
//! keying a `HashMap` by identity and handing callers an `Arc<Mutex<()>>`
//! that's never removed once created — so two requests racing on the same
//! fingerprint serialize instead of double-creating or double-deleting.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use appliance_api::{
    assemble_path, parse_volume_parameters, resolve_name, ApplianceApi, ApplianceError,
    DatasetHandle, DeleteStrategy, NameVars, Protocol, VolumeParameters,
};

/// Up to 3 retries with linear backoff when the appliance reports itself
/// transiently unavailable (reconnecting transport, timed-out heartbeat).
/// Any other error, including a fourth `Unavailable`, is returned as-is.
async fn with_retry<T, Fut>(mut call: impl FnMut() -> Fut) -> Result<T, ApplianceError>
where
    Fut: std::future::Future<Output = Result<T, ApplianceError>>,
{
    const RETRIES: u32 = 3;
    const BACKOFF_MS: u64 = 200;

    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(ApplianceError::Unavailable { message }) if attempt < RETRIES => {
                attempt += 1;
                warn!(attempt, %message, "appliance unavailable, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(BACKOFF_MS * attempt as u64)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

use crate::dev;
use crate::error::{controller_error_to_status, ControllerError};
use crate::proto::*;

const PVC_NAME_KEY: &str = "csi.storage.k8s.io/pvc/name";
const PVC_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pvc/namespace";

const PROTOCOL_PROPERTY: &str = "csi.io/protocol";
const DELETE_STRATEGY_PROPERTY: &str = "csi.io/delete-strategy";
const MARK_ADOPTABLE_PROPERTY: &str = "csi.io/mark-adoptable";
const NFS_SHARE_ID_PROPERTY: &str = "csi.io/nfs-share-id";
const DETACHED_SNAPSHOT_PROPERTY: &str = "detached_snapshot";

const DEFAULT_NVMF_PORT: u16 = 4420;
const DEFAULT_ISCSI_PORT: u16 = 3260;

type LockMap = RwLock<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Clone)]
pub(crate) struct Controller {
    appliance: ApplianceApi,
    locks: Arc<LockMap>,
}

impl Controller {
    pub(crate) fn new(appliance: ApplianceApi) -> Self {
        Controller {
            appliance,
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get-or-create the lock for `fingerprint`. Locks are never removed
    /// from the map: a concurrent create and delete racing on the same
    /// fingerprint must always serialize against the same mutex, not two
    /// different ones created moments apart (ABA).
    async fn lock_for(&self, fingerprint: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().await.get(fingerprint) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Split the sidecar-injected PVC identity keys out of the raw parameter
/// map before handing the rest to `parse_volume_parameters`, which rejects
/// anything it doesn't recognize.
fn extract_pvc_vars(raw: &HashMap<String, String>) -> (String, String, HashMap<String, String>) {
    let pvc_name = raw.get(PVC_NAME_KEY).cloned().unwrap_or_default();
    let pvc_namespace = raw.get(PVC_NAMESPACE_KEY).cloned().unwrap_or_default();
    let filtered = raw
        .iter()
        .filter(|(k, _)| k.as_str() != PVC_NAME_KEY && k.as_str() != PVC_NAMESPACE_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    (pvc_name, pvc_namespace, filtered)
}

fn requested_capacity(range: Option<&CapacityRange>) -> Result<u64, ControllerError> {
    match range {
        Some(range) if range.required_bytes > 0 => {
            if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
                return Err(ControllerError::InvalidArgument {
                    message: format!(
                        "required_bytes {} exceeds limit_bytes {}",
                        range.required_bytes, range.limit_bytes
                    ),
                });
            }
            Ok(range.required_bytes as u64)
        }
        Some(range) if range.limit_bytes > 0 => Ok(range.limit_bytes as u64),
        _ => Err(ControllerError::InvalidArgument {
            message: "capacity_range must set required_bytes or limit_bytes".into(),
        }),
    }
}

fn default_port(protocol: Protocol, params: &VolumeParameters) -> u16 {
    match params.port {
        Some(port) => port,
        None => match protocol {
            Protocol::NvmeTcp => DEFAULT_NVMF_PORT,
            Protocol::Iscsi => DEFAULT_ISCSI_PORT,
            Protocol::Nfs => 0,
        },
    }
}

fn volume_context(protocol: Protocol, path: &str, params: &VolumeParameters, port: u16) -> HashMap<String, String> {
    let mut ctx = HashMap::new();
    ctx.insert("protocol".to_string(), protocol_str(protocol).to_string());
    match protocol {
        Protocol::Nfs => {
            if let Some(server) = &params.server {
                ctx.insert("server".to_string(), server.clone());
            }
            ctx.insert("share_path".to_string(), path.to_string());
        }
        Protocol::NvmeTcp => {
            ctx.insert("subsystem_nqn".to_string(), dev::subsystem_nqn(path));
            ctx.insert("namespace_id".to_string(), "1".to_string());
            ctx.insert("transport".to_string(), "tcp".to_string());
            ctx.insert("port".to_string(), port.to_string());
            if let Some(server) = &params.server {
                ctx.insert("server".to_string(), server.clone());
            }
        }
        Protocol::Iscsi => {
            ctx.insert("target_iqn".to_string(), dev::target_iqn(path));
            ctx.insert("lun".to_string(), "0".to_string());
            ctx.insert("port".to_string(), port.to_string());
            if let Some(server) = &params.server {
                ctx.insert("portal".to_string(), format!("{}:{}", server, port));
            }
        }
    }
    if let Some(fs_type) = &params.fs_type {
        ctx.insert("fs_type".to_string(), fs_type.clone());
    }
    ctx
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn protocol_str(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Nfs => "nfs",
        Protocol::NvmeTcp => "nvmeof",
        Protocol::Iscsi => "iscsi",
    }
}

fn parse_protocol_property(value: Option<&String>) -> Protocol {
    match value.map(String::as_str) {
        Some("nvmeof") => Protocol::NvmeTcp,
        Some("iscsi") => Protocol::Iscsi,
        _ => Protocol::Nfs,
    }
}

fn volume_from_handle(handle: &DatasetHandle, content_source: Option<VolumeContentSource>) -> Volume {
    Volume {
        capacity_bytes: handle.capacity_bytes as i64,
        volume_id: handle.path.clone(),
        volume_context: handle.properties.clone(),
        content_source,
    }
}

impl Controller {
    async fn create_backing_store(
        &self,
        path: &str,
        csi_name: &str,
        capacity: u64,
        protocol: Protocol,
        params: &VolumeParameters,
        mut properties: HashMap<String, String>,
        content_source: Option<&VolumeContentSource>,
    ) -> Result<DatasetHandle, ControllerError> {
        properties.insert(PROTOCOL_PROPERTY.to_string(), protocol_str(protocol).to_string());
        properties.insert(
            DELETE_STRATEGY_PROPERTY.to_string(),
            match params.delete_strategy {
                DeleteStrategy::Delete => "delete".to_string(),
                DeleteStrategy::Retain => "retain".to_string(),
            },
        );
        if params.mark_adoptable {
            properties.insert(MARK_ADOPTABLE_PROPERTY.to_string(), "true".to_string());
        }
        if matches!(protocol, Protocol::Nfs) {
            properties.insert("quota".to_string(), capacity.to_string());
        }

        let handle = match content_source.and_then(|s| s.r#type.as_ref()) {
            Some(volume_content_source::Type::Snapshot(snap)) => {
                self.resolve_source_size(&snap.snapshot_id, capacity).await?;
                let mut handle = with_retry(|| self.appliance.create_clone(&snap.snapshot_id, path, csi_name))
                    .await
                    .map_err(ControllerError::from)?;
                if params.detached {
                    with_retry(|| self.appliance.promote_clone(path)).await.map_err(ControllerError::from)?;
                }
                with_retry(|| self.appliance.set_properties(path, &properties))
                    .await
                    .map_err(ControllerError::from)?;
                handle.properties.extend(properties);
                handle
            }
            Some(volume_content_source::Type::Volume(src)) => {
                self.resolve_source_size(&src.volume_id, capacity).await?;
                let mut handle = with_retry(|| self.appliance.create_clone(&src.volume_id, path, csi_name))
                    .await
                    .map_err(ControllerError::from)?;
                if params.detached {
                    with_retry(|| self.appliance.promote_clone(path)).await.map_err(ControllerError::from)?;
                }
                with_retry(|| self.appliance.set_properties(path, &properties))
                    .await
                    .map_err(ControllerError::from)?;
                handle.properties.extend(properties);
                handle
            }
            None => match protocol {
                Protocol::Nfs => with_retry(|| self.appliance.create_dataset(path, csi_name, capacity, &properties))
                    .await
                    .map_err(ControllerError::from)?,
                Protocol::NvmeTcp | Protocol::Iscsi => {
                    with_retry(|| self.appliance.create_zvol(path, csi_name, capacity, &properties))
                        .await
                        .map_err(ControllerError::from)?
                }
            },
        };

        if params.encryption {
            with_retry(|| {
                self.appliance.create_encryption_key(
                    path,
                    params.encryption_algorithm.as_deref().unwrap_or("aes-256-gcm"),
                    params.encryption_generate_key,
                    None,
                )
            })
            .await
            .map_err(ControllerError::from)?;
        }

        Ok(handle)
    }

    async fn resolve_source_size(&self, source_path: &str, requested: u64) -> Result<(), ControllerError> {
        if let Some(source) = with_retry(|| self.appliance.find_by_path(source_path))
            .await
            .map_err(ControllerError::from)?
        {
            if requested < source.capacity_bytes {
                return Err(ControllerError::SourceTooSmall {
                    requested,
                    source_size: source.capacity_bytes,
                });
            }
        }
        Ok(())
    }

    async fn expose(
        &self,
        path: &str,
        protocol: Protocol,
        params: &VolumeParameters,
        port: u16,
    ) -> Result<HashMap<String, String>, ControllerError> {
        let mut extra = HashMap::new();
        match protocol {
            Protocol::Nfs => {
                let share = with_retry(|| self.appliance.create_nfs_share(path, &HashMap::new()))
                    .await
                    .map_err(ControllerError::from)?;
                extra.insert(NFS_SHARE_ID_PROPERTY.to_string(), share.id);
            }
            Protocol::NvmeTcp => {
                let nqn = dev::subsystem_nqn(path);
                with_retry(|| self.appliance.create_nvmf_subsystem(&nqn, path, port))
                    .await
                    .map_err(ControllerError::from)?;
            }
            Protocol::Iscsi => {
                let iqn = dev::target_iqn(path);
                with_retry(|| self.appliance.create_iscsi_target(&iqn, port))
                    .await
                    .map_err(ControllerError::from)?;
                with_retry(|| self.appliance.link_extent(&iqn, path)).await.map_err(ControllerError::from)?;
            }
        }
        Ok(extra)
    }
}

#[tonic::async_trait]
impl controller_server::Controller for Controller {
    #[instrument(level = "info", skip(self, request), err)]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(controller_error_to_status(ControllerError::InvalidArgument {
                message: "name must not be empty".into(),
            }));
        }

        let lock = self.lock_for(&req.name).await;
        let _guard = lock.lock().await;

        let capacity = requested_capacity(req.capacity_range.as_ref()).map_err(controller_error_to_status)?;

        let (pvc_name, pvc_namespace, filtered) = extract_pvc_vars(&req.parameters);
        let params = parse_volume_parameters(&filtered)
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?;

        let vars = NameVars {
            pvc_name: &pvc_name,
            pvc_namespace: &pvc_namespace,
            pv_name: &req.name,
        };
        let sanitized = resolve_name(
            &vars,
            params.name_template.as_deref(),
            params.name_prefix.as_deref(),
            params.name_suffix.as_deref(),
        );
        let path = assemble_path(&params.pool, params.parent_dataset.as_deref(), &sanitized);
        let port = default_port(params.protocol, &params);

        if let Some(existing) = with_retry(|| self.appliance.find_by_csi_name(&req.name))
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?
        {
            if existing.path != path || existing.capacity_bytes < capacity {
                return Err(controller_error_to_status(ControllerError::AlreadyExistsIncompatible {
                    name: req.name.clone(),
                }));
            }
            info!(path = %existing.path, "CreateVolume: idempotent replay");
            return Ok(Response::new(CreateVolumeResponse {
                volume: Some(volume_from_handle(&existing, req.volume_content_source.clone())),
            }));
        }

        if params.adopt_existing {
            if let Some(unmanaged) = with_retry(|| self.appliance.find_by_path(&path))
                .await
                .map_err(ControllerError::from)
                .map_err(controller_error_to_status)?
            {
                if unmanaged.capacity_bytes < capacity {
                    return Err(controller_error_to_status(ControllerError::AlreadyExistsIncompatible {
                        name: req.name.clone(),
                    }));
                }
                info!(path = %path, "CreateVolume: adopting unmanaged entity");
                let adopted = with_retry(|| self.appliance.adopt(&path, &req.name))
                    .await
                    .map_err(ControllerError::from)
                    .map_err(controller_error_to_status)?;
                let context = volume_context(params.protocol, &path, &params, port);
                return Ok(Response::new(CreateVolumeResponse {
                    volume: Some(Volume {
                        capacity_bytes: adopted.capacity_bytes.max(capacity) as i64,
                        volume_id: path,
                        volume_context: context,
                        content_source: req.volume_content_source,
                    }),
                }));
            }
        }

        let handle = match self
            .create_backing_store(
                &path,
                &req.name,
                capacity,
                params.protocol,
                &params,
                params.zfs_properties.clone(),
                req.volume_content_source.as_ref(),
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => return Err(controller_error_to_status(err)),
        };

        match self.expose(&path, params.protocol, &params, port).await {
            Ok(extra) if extra.is_empty() => {}
            Ok(extra) => {
                if let Err(err) = with_retry(|| self.appliance.set_properties(&path, &extra)).await {
                    warn!(%path, error = %err, "failed to persist exposure properties, rolling back");
                    let _ = with_retry(|| self.appliance.delete(&path, true)).await;
                    return Err(controller_error_to_status(ControllerError::from(err)));
                }
            }
            Err(err) => {
                warn!(%path, error = %err, "exposure failed, rolling back dataset");
                let _ = with_retry(|| self.appliance.delete(&path, true)).await;
                return Err(controller_error_to_status(err));
            }
        }

        let context = volume_context(params.protocol, &path, &params, port);
        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes: handle.capacity_bytes.max(capacity) as i64,
                volume_id: path,
                volume_context: context,
                content_source: req.volume_content_source,
            }),
        }))
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        let handle = with_retry(|| self.appliance.find_by_path(&req.volume_id))
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?;

        let handle = match handle {
            Some(handle) => handle,
            None => {
                debug!(volume_id = %req.volume_id, "DeleteVolume: already absent");
                return Ok(Response::new(DeleteVolumeResponse {}));
            }
        };

        let retain = handle.properties.get(DELETE_STRATEGY_PROPERTY).map(String::as_str) == Some("retain");
        let mark_adoptable = handle.properties.get(MARK_ADOPTABLE_PROPERTY).map(String::as_str) == Some("true");
        if retain || mark_adoptable {
            with_retry(|| self.appliance.mark_adoptable(&req.volume_id))
                .await
                .map_err(ControllerError::from)
                .map_err(controller_error_to_status)?;
            return Ok(Response::new(DeleteVolumeResponse {}));
        }

        let dependents = with_retry(|| self.appliance.list_dependent_clones(&req.volume_id))
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?;
        if !dependents.is_empty() {
            return Err(controller_error_to_status(ControllerError::HasDependents {
                id: req.volume_id.clone(),
            }));
        }

        let protocol = parse_protocol_property(handle.properties.get(PROTOCOL_PROPERTY));
        match protocol {
            Protocol::Nfs => {
                if let Some(share_id) = handle.properties.get(NFS_SHARE_ID_PROPERTY) {
                    if let Err(err) = with_retry(|| self.appliance.delete_nfs_share(share_id)).await {
                        warn!(volume_id = %req.volume_id, %err, "failed to delete nfs share, continuing with dataset removal");
                    }
                }
            }
            Protocol::NvmeTcp => {
                let nqn = dev::subsystem_nqn(&req.volume_id);
                if let Err(err) = with_retry(|| self.appliance.delete_nvmf_subsystem(&nqn)).await {
                    warn!(volume_id = %req.volume_id, %err, "failed to delete nvmf subsystem, continuing with dataset removal");
                }
            }
            Protocol::Iscsi => {
                let iqn = dev::target_iqn(&req.volume_id);
                if let Err(err) = with_retry(|| self.appliance.delete_iscsi_target(&iqn)).await {
                    warn!(volume_id = %req.volume_id, %err, "failed to delete iscsi target, continuing with dataset removal");
                }
            }
        }

        with_retry(|| self.appliance.delete(&req.volume_id, true))
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?;

        Ok(Response::new(DeleteVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        let capacity = requested_capacity(req.capacity_range.as_ref()).map_err(controller_error_to_status)?;

        let handle = self
            .appliance
            .find_by_path(&req.volume_id)
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?
            .ok_or_else(|| controller_error_to_status(ControllerError::VolumeNotFound { id: req.volume_id.clone() }))?;

        let protocol = parse_protocol_property(handle.properties.get(PROTOCOL_PROPERTY));
        match protocol {
            Protocol::Nfs => {
                let mut props = HashMap::new();
                props.insert("quota".to_string(), capacity.to_string());
                self.appliance
                    .set_properties(&req.volume_id, &props)
                    .await
                    .map_err(ControllerError::from)
                    .map_err(controller_error_to_status)?;
                Ok(Response::new(ControllerExpandVolumeResponse {
                    capacity_bytes: capacity as i64,
                    node_expansion_required: false,
                }))
            }
            Protocol::NvmeTcp | Protocol::Iscsi => {
                self.appliance
                    .extend(&req.volume_id, capacity)
                    .await
                    .map_err(ControllerError::from)
                    .map_err(controller_error_to_status)?;
                Ok(Response::new(ControllerExpandVolumeResponse {
                    capacity_bytes: capacity as i64,
                    node_expansion_required: true,
                }))
            }
        }
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let lock = self.lock_for(&req.name).await;
        let _guard = lock.lock().await;

        let (_, _, filtered) = extract_pvc_vars(&req.parameters);
        let detached = filtered.get("detached_snapshots").map(|v| v == "true").unwrap_or(false);
        let parent_dataset = filtered.get("detached_snapshots_parent_dataset").cloned();

        if let Some(existing) = self
            .appliance
            .find_by_csi_name(&req.name)
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?
        {
            return Ok(Response::new(CreateSnapshotResponse {
                snapshot: Some(Snapshot {
                    size_bytes: existing.capacity_bytes as i64,
                    snapshot_id: existing.path,
                    source_volume_id: req.source_volume_id,
                    creation_time: now_unix(),
                    ready_to_use: true,
                }),
            }));
        }

        let snapshot = self
            .appliance
            .create_snapshot(&req.source_volume_id, &req.name, parent_dataset.as_deref())
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?;

        if detached {
            let mut props = HashMap::new();
            props.insert(DETACHED_SNAPSHOT_PROPERTY.to_string(), "true".to_string());
            if let Err(err) = self.appliance.set_properties(&snapshot.id, &props).await {
                warn!(snapshot = %snapshot.id, %err, "failed to mark detached snapshot");
            }
        }

        Ok(Response::new(CreateSnapshotResponse {
            snapshot: Some(Snapshot {
                size_bytes: snapshot.size_bytes as i64,
                snapshot_id: snapshot.id,
                source_volume_id: snapshot.source_path,
                creation_time: now_unix(),
                ready_to_use: snapshot.ready_to_use,
            }),
        }))
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        let lock = self.lock_for(&req.snapshot_id).await;
        let _guard = lock.lock().await;

        match self.appliance.delete_snapshot(&req.snapshot_id).await {
            Ok(()) => Ok(Response::new(DeleteSnapshotResponse {})),
            Err(ApplianceError::NotFound { .. }) => Ok(Response::new(DeleteSnapshotResponse {})),
            Err(err) => Err(controller_error_to_status(ControllerError::from(err))),
        }
    }

    #[instrument(level = "debug", skip(self, request), err)]
    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();

        let handle = self
            .appliance
            .find_by_path(&req.volume_id)
            .await
            .map_err(ControllerError::from)
            .map_err(controller_error_to_status)?
            .ok_or_else(|| controller_error_to_status(ControllerError::VolumeNotFound { id: req.volume_id.clone() }))?;

        let protocol = parse_protocol_property(handle.properties.get(PROTOCOL_PROPERTY));
        let (abnormal, message) = match protocol {
            Protocol::Nfs => match handle.properties.get(NFS_SHARE_ID_PROPERTY) {
                None => (true, "nfs share missing".to_string()),
                Some(_) => (false, String::new()),
            },
            Protocol::NvmeTcp | Protocol::Iscsi => (false, String::new()),
        };

        Ok(Response::new(ControllerGetVolumeResponse {
            volume: Some(volume_from_handle(&handle, None)),
            volume_condition: Some(VolumeCondition { abnormal, message }),
        }))
    }

    #[instrument(level = "debug", skip(self, _request))]
    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        use controller_service_capability::{rpc::Type as RpcType, Type as CapType, Rpc};

        // No ControllerPublishVolume/ControllerUnpublishVolume RPCs: the
        // appliance's targets/shares are reachable from any node without a
        // separate controller-side attach step, so that capability isn't
        // advertised.
        let rpcs = [
            RpcType::CreateDeleteVolume,
            RpcType::ExpandVolume,
            RpcType::CreateDeleteSnapshot,
            RpcType::CloneVolume,
            RpcType::GetVolume,
        ];

        let capabilities = rpcs
            .into_iter()
            .map(|r#type| ControllerServiceCapability {
                r#type: Some(CapType::Rpc(Rpc { r#type: r#type as i32 })),
            })
            .collect();

        Ok(Response::new(ControllerGetCapabilitiesResponse { capabilities }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(protocol: Protocol) -> VolumeParameters {
        VolumeParameters {
            pool: "tank".to_string(),
            parent_dataset: None,
            protocol,
            server: Some("10.0.0.5".to_string()),
            transport: None,
            port: None,
            fs_type: Some("ext4".to_string()),
            name_template: None,
            name_prefix: None,
            name_suffix: None,
            delete_strategy: DeleteStrategy::Delete,
            detached: false,
            detached_snapshots: false,
            detached_snapshots_parent_dataset: None,
            adopt_existing: false,
            mark_adoptable: false,
            encryption: false,
            encryption_algorithm: None,
            encryption_generate_key: false,
            zfs_properties: HashMap::new(),
        }
    }

    #[test]
    fn extract_pvc_vars_splits_sidecar_keys_from_storage_class_params() {
        let mut raw = HashMap::new();
        raw.insert(PVC_NAME_KEY.to_string(), "data".to_string());
        raw.insert(PVC_NAMESPACE_KEY.to_string(), "prod".to_string());
        raw.insert("pool".to_string(), "tank".to_string());

        let (name, namespace, filtered) = extract_pvc_vars(&raw);
        assert_eq!(name, "data");
        assert_eq!(namespace, "prod");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("pool"), Some(&"tank".to_string()));
    }

    #[test]
    fn requested_capacity_prefers_required_over_limit() {
        let range = CapacityRange { required_bytes: 100, limit_bytes: 200 };
        assert_eq!(requested_capacity(Some(&range)).unwrap(), 100);
    }

    #[test]
    fn requested_capacity_falls_back_to_limit() {
        let range = CapacityRange { required_bytes: 0, limit_bytes: 200 };
        assert_eq!(requested_capacity(Some(&range)).unwrap(), 200);
    }

    #[test]
    fn requested_capacity_rejects_missing_range() {
        assert!(requested_capacity(None).is_err());
    }

    #[test]
    fn requested_capacity_rejects_required_over_limit() {
        let range = CapacityRange { required_bytes: 10 << 30, limit_bytes: 5 << 30 };
        assert!(requested_capacity(Some(&range)).is_err());
    }

    #[test]
    fn default_port_uses_protocol_default_when_unset() {
        assert_eq!(default_port(Protocol::NvmeTcp, &params(Protocol::NvmeTcp)), DEFAULT_NVMF_PORT);
        assert_eq!(default_port(Protocol::Iscsi, &params(Protocol::Iscsi)), DEFAULT_ISCSI_PORT);
        assert_eq!(default_port(Protocol::Nfs, &params(Protocol::Nfs)), 0);
    }

    #[test]
    fn default_port_honors_explicit_parameter() {
        let mut p = params(Protocol::NvmeTcp);
        p.port = Some(5000);
        assert_eq!(default_port(Protocol::NvmeTcp, &p), 5000);
    }

    #[test]
    fn volume_context_nfs_carries_share_path_and_server() {
        let ctx = volume_context(Protocol::Nfs, "tank/vol-1", &params(Protocol::Nfs), 0);
        assert_eq!(ctx.get("protocol"), Some(&"nfs".to_string()));
        assert_eq!(ctx.get("share_path"), Some(&"tank/vol-1".to_string()));
        assert_eq!(ctx.get("server"), Some(&"10.0.0.5".to_string()));
    }

    #[test]
    fn volume_context_nvmeof_carries_nqn_and_port() {
        let ctx = volume_context(Protocol::NvmeTcp, "tank/vol-1", &params(Protocol::NvmeTcp), 4420);
        assert_eq!(ctx.get("protocol"), Some(&"nvmeof".to_string()));
        assert_eq!(ctx.get("subsystem_nqn"), Some(&dev::subsystem_nqn("tank/vol-1")));
        assert_eq!(ctx.get("port"), Some(&"4420".to_string()));
    }

    #[test]
    fn volume_context_iscsi_builds_portal_from_server_and_port() {
        let ctx = volume_context(Protocol::Iscsi, "tank/vol-1", &params(Protocol::Iscsi), 3260);
        assert_eq!(ctx.get("target_iqn"), Some(&dev::target_iqn("tank/vol-1")));
        assert_eq!(ctx.get("portal"), Some(&"10.0.0.5:3260".to_string()));
    }

    #[test]
    fn parse_protocol_property_defaults_to_nfs() {
        assert!(matches!(parse_protocol_property(None), Protocol::Nfs));
        assert!(matches!(
            parse_protocol_property(Some(&"nvmeof".to_string())),
            Protocol::NvmeTcp
        ));
        assert!(matches!(parse_protocol_property(Some(&"iscsi".to_string())), Protocol::Iscsi));
        assert!(matches!(parse_protocol_property(Some(&"bogus".to_string())), Protocol::Nfs));
    }

    #[test]
    fn volume_from_handle_copies_path_and_capacity() {
        let mut properties = HashMap::new();
        properties.insert("csi.io/protocol".to_string(), "nfs".to_string());
        let handle = DatasetHandle {
            path: "tank/vol-1".to_string(),
            capacity_bytes: 1024,
            properties,
        };
        let volume = volume_from_handle(&handle, None);
        assert_eq!(volume.volume_id, "tank/vol-1");
        assert_eq!(volume.capacity_bytes, 1024);
        assert_eq!(volume.volume_context.get("csi.io/protocol"), Some(&"nfs".to_string()));
    }
}
