//! CSI Node service: stage/publish/unpublish/unstage and expansion on the
//! local node.
//!
//! Operations on the same volume id are serialized on a per-volume lock;
//! a bounded `tokio::sync::Semaphore` caps how many volumes this node
//! publishes concurrently (SPEC 4.6.4), with the permit for a staged volume
//! held in a side table until `NodeUnstageVolume` releases it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sys_mount::{unmount, UnmountFlags};
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::dev::{iscsi::IscsiDevice, nvmf::NvmfDevice, Attach, Detach, Device};
use crate::error::{publish_error_to_status, PublishError};
use crate::proto::*;
use crate::session::{SessionTable, SubsystemKey};
use crate::{findmnt, format, mount};

const DEFAULT_NFS_OPTIONS: &[&str] = &["vers=4.2", "nolock"];
const ATTACH_POLL_INTERVAL_MS: u64 = 500;
const ATTACH_RETRIES: u32 = 20;
const UNMOUNT_RETRIES: u32 = 3;
const UNMOUNT_RETRY_INTERVAL_MS: u64 = 200;

type LockMap = RwLock<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Clone)]
pub(crate) struct Node {
    node_name: String,
    max_volumes_per_node: u32,
    locks: Arc<LockMap>,
    sessions: Arc<SessionTable>,
    caps: Arc<Semaphore>,
    held: Arc<AsyncMutex<HashMap<String, OwnedSemaphorePermit>>>,
    /// Which subsystem/target key a staged volume attached through, so
    /// `NodeUnstageVolume` (given only a volume id) knows whether there is a
    /// block session to release without having to guess from the mount
    /// table's source string.
    block_keys: Arc<AsyncMutex<HashMap<String, SubsystemKey>>>,
}

impl Node {
    /// Seeds the session table from whatever nvmf/iscsi sessions udev
    /// already reports as attached, so a publisher restart doesn't forget a
    /// session other staged volumes on this node still reference.
    pub(crate) async fn new(node_name: String, max_volumes_per_node: u32) -> Self {
        let sessions = SessionTable::new();
        match crate::dev::Device::enumerate_sessions().await {
            Ok(found) => sessions.reconcile(found).await,
            Err(err) => warn!(%err, "failed to enumerate existing nvmf/iscsi sessions at startup"),
        }

        Node {
            node_name,
            max_volumes_per_node,
            locks: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(sessions),
            caps: Arc::new(Semaphore::new(max_volumes_per_node as usize)),
            held: Arc::new(AsyncMutex::new(HashMap::new())),
            block_keys: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, volume_id: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().await.get(volume_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Merge user-supplied mount options with protocol defaults, user entries
/// taking precedence over a default carrying the same option key
/// (`vers=4.2` in the defaults loses to a user-supplied `vers=4.1`).
fn merge_mount_options(user: &[String], defaults: &[&str]) -> Vec<String> {
    let user_keys: Vec<&str> = user.iter().map(|e| e.split('=').next().unwrap_or(e)).collect();
    let mut merged: Vec<String> = defaults
        .iter()
        .filter(|d| !user_keys.contains(&d.split('=').next().unwrap_or(d)))
        .map(|d| d.to_string())
        .collect();
    merged.extend(user.iter().cloned());
    merged
}

/// `NodeStageVolume` carries no readonly flag of its own, so staging only
/// checks that the access mode is one this driver recognizes.
fn validate_access_mode(mode: Option<&volume_capability::AccessMode>) -> Result<(), PublishError> {
    use volume_capability::access_mode::Mode;

    let mode = mode.ok_or_else(|| PublishError::InvalidArgument {
        message: "missing access mode".into(),
    })?;

    match Mode::from_i32(mode.mode) {
        Some(Mode::SingleNodeWriter)
        | Some(Mode::SingleNodeReaderOnly)
        | Some(Mode::MultiNodeReaderOnly)
        | Some(Mode::MultiNodeSingleWriter)
        | Some(Mode::MultiNodeMultiWriter) => Ok(()),
        _ => Err(PublishError::InvalidArgument {
            message: format!("unsupported access mode {}", mode.mode),
        }),
    }
}

/// `NodePublishVolume` carries the per-mount readonly flag, so this is
/// where a reader-only access mode is actually enforced against it.
fn access_mode_allows(mode: Option<&volume_capability::AccessMode>, readonly: bool) -> Result<(), PublishError> {
    use volume_capability::access_mode::Mode;

    validate_access_mode(mode)?;
    let mode = mode.expect("validated above");

    let requires_ro = matches!(
        Mode::from_i32(mode.mode),
        Some(Mode::SingleNodeReaderOnly) | Some(Mode::MultiNodeReaderOnly)
    );
    if requires_ro && !readonly {
        return Err(PublishError::InvalidArgument {
            message: "read-only access mode requires the readonly flag".into(),
        });
    }
    Ok(())
}

fn mount_capability(cap: &VolumeCapability) -> Result<&volume_capability::MountVolume, PublishError> {
    match &cap.access_type {
        Some(volume_capability::AccessType::Mount(m)) => Ok(m),
        Some(volume_capability::AccessType::Block(_)) => Err(PublishError::InvalidArgument {
            message: "raw block volumes are not supported".into(),
        }),
        None => Err(PublishError::InvalidArgument {
            message: "missing access type".into(),
        }),
    }
}

enum Protocol {
    Nfs,
    Nvmf,
    Iscsi,
}

fn protocol_of(ctx: &HashMap<String, String>) -> Result<Protocol, PublishError> {
    match ctx.get("protocol").map(String::as_str) {
        Some("nfs") => Ok(Protocol::Nfs),
        Some("nvmeof") => Ok(Protocol::Nvmf),
        Some("iscsi") => Ok(Protocol::Iscsi),
        other => Err(PublishError::InvalidArgument {
            message: format!("missing or unknown protocol in volume context: {:?}", other),
        }),
    }
}

fn context_get<'a>(ctx: &'a HashMap<String, String>, key: &str) -> Result<&'a str, PublishError> {
    ctx.get(key).map(String::as_str).ok_or_else(|| PublishError::InvalidArgument {
        message: format!("missing '{}' in volume context", key),
    })
}

/// Retry a plain (non-stale) unmount a few times before the caller escalates
/// to a forced lazy unmount: a transient `EBUSY` from a process still
/// draining its last reference to the mountpoint shouldn't fail the RPC.
async fn unmount_with_retry(target: &str, unmount_fn: fn(&str) -> std::io::Result<()>) -> Result<(), PublishError> {
    let mut last_err = None;
    for attempt in 1..=UNMOUNT_RETRIES {
        match unmount_fn(target) {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(target, attempt, %err, "unmount attempt failed, retrying");
                last_err = Some(err);
                tokio::time::sleep(Duration::from_millis(UNMOUNT_RETRY_INTERVAL_MS)).await;
            }
        }
    }
    Err(PublishError::Mount {
        target: target.to_string(),
        source: last_err.expect("loop runs at least once"),
    })
}

impl Node {
    async fn build_device(
        volume_id: &str,
        ctx: &HashMap<String, String>,
        protocol: &Protocol,
    ) -> Result<(Box<dyn Attach>, SubsystemKey), PublishError> {
        match protocol {
            Protocol::Nvmf => {
                let nqn = crate::dev::subsystem_nqn(volume_id);
                let host = context_get(ctx, "server").unwrap_or("127.0.0.1").to_string();
                let port: u16 = context_get(ctx, "port")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(4420);
                let device = NvmfDevice::new(host, port, nqn.clone())?;
                Ok((Box::new(device), SubsystemKey::nvmf(&nqn)))
            }
            Protocol::Iscsi => {
                let iqn = crate::dev::target_iqn(volume_id);
                let portal = match context_get(ctx, "portal") {
                    Ok(portal) => portal.to_string(),
                    Err(_) => {
                        let server = context_get(ctx, "server").unwrap_or("127.0.0.1");
                        let port = context_get(ctx, "port").unwrap_or("3260");
                        format!("{}:{}", server, port)
                    }
                };
                let lun: u16 = context_get(ctx, "lun").ok().and_then(|l| l.parse().ok()).unwrap_or(0);
                let device = IscsiDevice::new(portal.clone(), iqn.clone(), lun)?;
                Ok((Box::new(device), SubsystemKey::iscsi(&portal, &iqn)))
            }
            Protocol::Nfs => unreachable!("NFS has no block device to attach"),
        }
    }

    async fn stage_block(
        &self,
        volume_id: &str,
        staging_path: &str,
        ctx: &HashMap<String, String>,
        protocol: Protocol,
        fs_type: &str,
        mount_flags: &[String],
    ) -> Result<(), PublishError> {
        if let Some(mount) = mount::find_mount(None, Some(staging_path)) {
            debug!(%volume_id, dest = %mount.dest.display(), "already staged");
            return Ok(());
        }

        let (device, key) = Self::build_device(volume_id, ctx, &protocol).await?;

        let devname = match device.find().await? {
            Some(devname) => devname,
            None => {
                device.attach().await?;
                Device::wait_for_device(
                    device.as_ref(),
                    std::time::Duration::from_millis(ATTACH_POLL_INTERVAL_MS),
                    ATTACH_RETRIES,
                )
                .await?
            }
        };

        self.sessions.acquire(key.clone()).await;
        self.block_keys.lock().await.insert(volume_id.to_string(), key);

        format::probed_format(&devname, fs_type).await?;

        std::fs::create_dir_all(staging_path).map_err(|source| PublishError::Mount {
            target: staging_path.to_string(),
            source,
        })?;

        mount::filesystem_mount(&devname, staging_path, fs_type, mount_flags).map_err(|source| PublishError::Mount {
            target: staging_path.to_string(),
            source,
        })?;

        Ok(())
    }

}

#[tonic::async_trait]
impl node_server::Node for Node {
    #[instrument(level = "info", skip(self, request), err)]
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() || req.staging_target_path.is_empty() {
            return Err(publish_error_to_status(PublishError::InvalidArgument {
                message: "volume_id and staging_target_path are required".into(),
            }));
        }

        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| PublishError::InvalidArgument {
                message: "missing volume_capability".into(),
            })
            .map_err(publish_error_to_status)?;

        validate_access_mode(cap.access_mode.as_ref()).map_err(publish_error_to_status)?;
        let mnt = mount_capability(cap).map_err(publish_error_to_status)?;

        let protocol = protocol_of(&req.volume_context).map_err(publish_error_to_status)?;

        {
            let mut held = self.held.lock().await;
            if !held.contains_key(&req.volume_id) {
                let permit = self.caps.clone().try_acquire_owned().map_err(|_| {
                    publish_error_to_status(PublishError::InvalidArgument {
                        message: format!(
                            "node {} already publishes the maximum of {} volumes",
                            self.node_name, self.max_volumes_per_node
                        ),
                    })
                })?;
                held.insert(req.volume_id.clone(), permit);
            }
        }

        let result = match protocol {
            Protocol::Nfs => {
                if mount::find_mount(None, Some(&req.staging_target_path)).is_some() {
                    Ok(())
                } else {
                    let server = context_get(&req.volume_context, "server").map_err(publish_error_to_status)?;
                    let share_path = context_get(&req.volume_context, "share_path").map_err(publish_error_to_status)?;
                    let source = format!("{}:{}", server, share_path);
                    let options = merge_mount_options(&mnt.mount_flags, DEFAULT_NFS_OPTIONS);
                    std::fs::create_dir_all(&req.staging_target_path)
                        .map_err(|source| PublishError::Mount { target: req.staging_target_path.clone(), source })
                        .and_then(|_| {
                            mount::filesystem_mount(&source, &req.staging_target_path, "nfs", &options).map(|_| ()).map_err(
                                |source| PublishError::Mount { target: req.staging_target_path.clone(), source },
                            )
                        })
                }
            }
            Protocol::Nvmf | Protocol::Iscsi => {
                let fs_type = mnt.fs_type.as_str();
                if fs_type.is_empty() {
                    Err(PublishError::InvalidArgument {
                        message: "fs_type is required for block-backed volumes".into(),
                    })
                } else {
                    self.stage_block(
                        &req.volume_id,
                        &req.staging_target_path,
                        &req.volume_context,
                        protocol,
                        fs_type,
                        &mnt.mount_flags,
                    )
                    .await
                }
            }
        };

        if result.is_err() {
            self.held.lock().await.remove(&req.volume_id);
        }
        result.map_err(publish_error_to_status)?;

        info!(volume_id = %req.volume_id, "staged");
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        if mount::find_mount(None, Some(&req.staging_target_path)).is_some() {
            let stale = is_stale(&req.staging_target_path).await;

            if stale {
                warn!(volume_id = %req.volume_id, "stale mount detected, forcing unmount");
                unmount(&req.staging_target_path, UnmountFlags::FORCE | UnmountFlags::DETACH)
                    .map_err(|source| PublishError::Mount { target: req.staging_target_path.clone(), source })
                    .map_err(publish_error_to_status)?;
            } else if unmount_with_retry(&req.staging_target_path, mount::filesystem_unmount).await.is_err() {
                warn!(volume_id = %req.volume_id, "unmount retries exhausted, forcing unmount");
                unmount(&req.staging_target_path, UnmountFlags::FORCE | UnmountFlags::DETACH)
                    .map_err(|source| PublishError::Mount { target: req.staging_target_path.clone(), source })
                    .map_err(publish_error_to_status)?;
            }
        } else {
            debug!(volume_id = %req.volume_id, "NodeUnstageVolume: already unstaged");
        }

        if let Some(key) = self.block_keys.lock().await.remove(&req.volume_id) {
            let remaining = self.sessions.release(key).await;
            if remaining == 0 {
                if let Some(device) = Device::lookup(&req.volume_id).await.map_err(PublishError::from).map_err(publish_error_to_status)? {
                    device.detach().await.map_err(PublishError::from).map_err(publish_error_to_status)?;
                }
            } else {
                debug!(volume_id = %req.volume_id, remaining, "subsystem still referenced, leaving session attached");
            }
        }

        self.held.lock().await.remove(&req.volume_id);

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.staging_target_path.is_empty() || req.target_path.is_empty() {
            return Err(publish_error_to_status(PublishError::InvalidArgument {
                message: "staging_target_path and target_path are required".into(),
            }));
        }

        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| PublishError::InvalidArgument {
                message: "missing volume_capability".into(),
            })
            .map_err(publish_error_to_status)?;
        access_mode_allows(cap.access_mode.as_ref(), req.readonly).map_err(publish_error_to_status)?;

        if mount::find_mount(None, Some(&req.staging_target_path)).is_none() {
            return Err(publish_error_to_status(PublishError::InvalidArgument {
                message: format!("{} is not staged", req.volume_id),
            }));
        }

        if mount::find_mount(Some(&req.staging_target_path), Some(&req.target_path)).is_some() {
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        std::fs::create_dir_all(&req.target_path)
            .map_err(|source| PublishError::Mount { target: req.target_path.clone(), source })
            .map_err(publish_error_to_status)?;

        mount::bind_mount(&req.staging_target_path, &req.target_path, false)
            .map_err(|source| PublishError::Mount { target: req.target_path.clone(), source })
            .map_err(publish_error_to_status)?;

        if req.readonly {
            mount::bind_remount(&req.target_path, &["ro".to_string()])
                .map_err(|source| PublishError::Mount { target: req.target_path.clone(), source })
                .map_err(publish_error_to_status)?;
        }

        info!(volume_id = %req.volume_id, target = %req.target_path, "published");
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        if mount::find_mount(None, Some(&req.target_path)).is_some() {
            if unmount_with_retry(&req.target_path, mount::bind_unmount).await.is_err() {
                warn!(volume_id = %req.volume_id, "bind unmount retries exhausted, forcing unmount");
                unmount(&req.target_path, UnmountFlags::FORCE | UnmountFlags::DETACH)
                    .map_err(|source| PublishError::Mount { target: req.target_path.clone(), source })
                    .map_err(publish_error_to_status)?;
            }
        } else {
            debug!(volume_id = %req.volume_id, "NodeUnpublishVolume: already unpublished");
        }

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    #[instrument(level = "info", skip(self, request), err)]
    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let lock = self.lock_for(&req.volume_id).await;
        let _guard = lock.lock().await;

        let path = if !req.staging_target_path.is_empty() {
            req.staging_target_path.clone()
        } else {
            req.volume_path.clone()
        };

        let device_path = findmnt::get_devicepath(&path)
            .map_err(PublishError::from)
            .map_err(publish_error_to_status)?
            .ok_or_else(|| {
                publish_error_to_status(PublishError::InvalidArgument {
                    message: format!("{} is not mounted", path),
                })
            })?;

        let mountpaths = findmnt::get_mountpaths(&device_path)
            .map_err(PublishError::from)
            .map_err(publish_error_to_status)?;
        let fstype = mountpaths
            .first()
            .map(|m| m.fstype.clone())
            .unwrap_or_else(|| "ext4".to_string());

        let capacity_bytes = req.capacity_range.map(|c| c.required_bytes).unwrap_or(0);

        let program = match fstype.as_str() {
            "xfs" => "xfs_growfs",
            _ => "resize2fs",
        };
        let target = if program == "xfs_growfs" { path.clone() } else { device_path.clone() };
        let output = std::process::Command::new(program)
            .arg(&target)
            .output()
            .map_err(|source| PublishError::Mount { target: target.clone(), source })
            .map_err(publish_error_to_status)?;

        if !output.status.success() {
            return Err(publish_error_to_status(PublishError::Format {
                message: format!(
                    "{} failed: {}",
                    program,
                    String::from_utf8_lossy(&output.stderr)
                ),
            }));
        }

        Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes }))
    }

    #[instrument(level = "debug", skip(self, _request))]
    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        use node_service_capability::{rpc::Type as RpcType, Rpc, Type as CapType};

        let rpcs = [RpcType::StageUnstageVolume, RpcType::ExpandVolume];

        let capabilities = rpcs
            .into_iter()
            .map(|r#type| NodeServiceCapability {
                r#type: Some(CapType::Rpc(Rpc { r#type: r#type as i32 })),
            })
            .collect();

        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities }))
    }

    #[instrument(level = "debug", skip(self, _request))]
    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: self.max_volumes_per_node as i64,
        }))
    }
}

/// NFS going stale looks different from a block device going stale: the
/// kernel mount entry survives an appliance restart or network partition,
/// but any syscall touching the mountpoint blocks forever. Block devices
/// instead disappear from udev outright. Check both ways so a plain
/// unmount never hangs on either transport.
async fn is_stale(staging_path: &str) -> bool {
    let fstype = mount::find_mount(None, Some(staging_path)).map(|m| m.fstype);

    match fstype.as_deref() {
        Some("nfs") | Some("nfs4") => stat_times_out(staging_path).await,
        _ => match findmnt::get_devicepath(staging_path) {
            Ok(Some(device)) => !std::path::Path::new(&device).exists(),
            Ok(None) => true,
            Err(_) => true,
        },
    }
}

async fn stat_times_out(path: &str) -> bool {
    let path = path.to_string();
    let probe = tokio::task::spawn_blocking(move || std::fs::metadata(path));
    tokio::time::timeout(std::time::Duration::from_secs(3), probe)
        .await
        .is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_mode(mode: volume_capability::access_mode::Mode) -> volume_capability::AccessMode {
        volume_capability::AccessMode { mode: mode as i32 }
    }

    #[test]
    fn merge_keeps_user_options_over_defaults() {
        let user = vec!["vers=4.1".to_string(), "ro".to_string()];
        let merged = merge_mount_options(&user, DEFAULT_NFS_OPTIONS);
        assert!(merged.contains(&"vers=4.1".to_string()));
        assert!(merged.contains(&"nolock".to_string()));
        assert!(!merged.contains(&"vers=4.2".to_string()));
        assert!(merged.contains(&"ro".to_string()));
    }

    #[test]
    fn merge_applies_all_defaults_when_user_has_none() {
        let merged = merge_mount_options(&[], DEFAULT_NFS_OPTIONS);
        assert_eq!(merged, vec!["vers=4.2".to_string(), "nolock".to_string()]);
    }

    #[test]
    fn validate_access_mode_accepts_any_known_variant() {
        use volume_capability::access_mode::Mode;
        for mode in [
            Mode::SingleNodeWriter,
            Mode::SingleNodeReaderOnly,
            Mode::MultiNodeReaderOnly,
            Mode::MultiNodeSingleWriter,
            Mode::MultiNodeMultiWriter,
        ] {
            assert!(validate_access_mode(Some(&access_mode(mode))).is_ok());
        }
    }

    #[test]
    fn validate_access_mode_rejects_missing_mode() {
        assert!(validate_access_mode(None).is_err());
    }

    #[test]
    fn access_mode_allows_requires_readonly_flag_for_reader_only_modes() {
        use volume_capability::access_mode::Mode;
        let ro_mode = access_mode(Mode::SingleNodeReaderOnly);
        assert!(access_mode_allows(Some(&ro_mode), true).is_ok());
        assert!(access_mode_allows(Some(&ro_mode), false).is_err());
    }

    #[test]
    fn access_mode_allows_single_node_writer_regardless_of_readonly() {
        use volume_capability::access_mode::Mode;
        let rw_mode = access_mode(Mode::SingleNodeWriter);
        assert!(access_mode_allows(Some(&rw_mode), true).is_ok());
        assert!(access_mode_allows(Some(&rw_mode), false).is_ok());
    }

    #[test]
    fn protocol_of_parses_known_protocols() {
        for (value, matches_nfs) in [("nfs", true), ("nvmeof", false), ("iscsi", false)] {
            let mut ctx = HashMap::new();
            ctx.insert("protocol".to_string(), value.to_string());
            let protocol = protocol_of(&ctx).expect("recognized protocol");
            assert_eq!(matches!(protocol, Protocol::Nfs), matches_nfs);
        }
    }

    #[test]
    fn protocol_of_rejects_unknown_or_missing_protocol() {
        assert!(protocol_of(&HashMap::new()).is_err());
        let mut ctx = HashMap::new();
        ctx.insert("protocol".to_string(), "ftp".to_string());
        assert!(protocol_of(&ctx).is_err());
    }

    #[test]
    fn context_get_reports_missing_key_by_name() {
        let ctx = HashMap::new();
        let err = context_get(&ctx, "share_path").unwrap_err();
        match err {
            PublishError::InvalidArgument { message } => assert!(message.contains("share_path")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
