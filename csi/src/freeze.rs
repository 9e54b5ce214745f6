//! Freeze/unfreeze and volume lookup helpers exposed over the node plugin's
//! auxiliary loopback gRPC server, used by backup tooling that needs a
//! filesystem-consistent snapshot window without going through the CSI
//! snapshot RPCs.

use snafu::{ResultExt, Snafu};
use tokio::process::Command;
use tonic::{Code, Request, Response, Status};

use crate::dev::Device;
use crate::error::DeviceError;
use crate::proto::node_plugin::{
    node_plugin_server, FindVolumeReply, FindVolumeRequest, FreezeFsReply, FreezeFsRequest, UnfreezeFsReply,
    UnfreezeFsRequest,
};
use crate::{findmnt, mount};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum ServiceError {
    #[snafu(display("cannot find volume: volume ID: {}", volid))]
    VolumeNotFound { volid: String },

    #[snafu(display("fsfreeze failed: volume ID: {}, {}", volid, error))]
    FsfreezeFailed { volid: String, error: String },

    #[snafu(display("internal failure: volume ID: {}, {}", volid, source))]
    InternalFailure { source: DeviceError, volid: String },

    #[snafu(display("io error: volume ID: {}, {}", volid, source))]
    IoError { source: std::io::Error, volid: String },

    #[snafu(display("inconsistent mount filesystems: volume ID: {}", volid))]
    InconsistentMountFs { volid: String },
}

const FSFREEZE: &str = "fsfreeze";

async fn fsfreeze(volume_id: &str, freeze_op: &str) -> Result<(), ServiceError> {
    let device = Device::lookup(volume_id)
        .await
        .context(InternalFailureSnafu {
            volid: volume_id.to_string(),
        })?
        .ok_or_else(|| ServiceError::VolumeNotFound {
            volid: volume_id.to_string(),
        })?;

    let device_path = device.devname();
    let mount = mount::find_mount(Some(&device_path), None).ok_or_else(|| ServiceError::VolumeNotFound {
        volid: volume_id.to_string(),
    })?;

    let dest = mount.dest.display().to_string();
    let output = Command::new(FSFREEZE)
        .args([freeze_op, &dest])
        .output()
        .await
        .context(IoSnafu {
            volid: volume_id.to_string(),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ServiceError::FsfreezeFailed {
            volid: volume_id.to_string(),
            error: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) async fn freeze_volume(volume_id: &str) -> Result<(), ServiceError> {
    fsfreeze(volume_id, "--freeze").await
}

pub(crate) async fn unfreeze_volume(volume_id: &str) -> Result<(), ServiceError> {
    fsfreeze(volume_id, "--unfreeze").await
}

/// Report the filesystem currently mounted from a staged volume's device,
/// erroring if the device is mounted with more than one inconsistent fstype
/// (should be impossible, kept as a defensive check).
pub(crate) async fn find_volume(volume_id: &str) -> Result<String, ServiceError> {
    let device = Device::lookup(volume_id)
        .await
        .context(InternalFailureSnafu {
            volid: volume_id.to_string(),
        })?
        .ok_or_else(|| ServiceError::VolumeNotFound {
            volid: volume_id.to_string(),
        })?;

    let device_path = device.devname();
    let mountpaths = findmnt::get_mountpaths(&device_path).context(InternalFailureSnafu {
        volid: volume_id.to_string(),
    })?;

    if mountpaths.is_empty() {
        return Err(ServiceError::VolumeNotFound {
            volid: volume_id.to_string(),
        });
    }

    let fstype = mountpaths[0].fstype.clone();
    for devmount in &mountpaths {
        if devmount.fstype != fstype {
            return Err(ServiceError::InconsistentMountFs {
                volid: volume_id.to_string(),
            });
        }
    }

    Ok(fstype)
}

fn service_error_to_status(err: ServiceError) -> Status {
    match err {
        ServiceError::VolumeNotFound { volid } => Status::new(Code::NotFound, format!("volume '{}' not found", volid)),
        ServiceError::FsfreezeFailed { volid, error } => {
            Status::new(Code::Internal, format!("fsfreeze failed for '{}': {}", volid, error))
        }
        ServiceError::InternalFailure { source, volid } => {
            Status::new(Code::Internal, format!("internal failure for '{}': {}", volid, source))
        }
        ServiceError::IoError { source, volid } => Status::new(Code::Internal, format!("io error for '{}': {}", volid, source)),
        ServiceError::InconsistentMountFs { volid } => Status::new(
            Code::Internal,
            format!("inconsistent mount filesystems for '{}'", volid),
        ),
    }
}

/// gRPC adapter for the freeze/unfreeze/find-volume surface, served on the
/// node plugin's loopback endpoint alongside the CSI Unix-socket server.
#[derive(Clone, Default)]
pub(crate) struct NodePluginSvc {}

#[tonic::async_trait]
impl node_plugin_server::NodePlugin for NodePluginSvc {
    async fn freeze_fs(&self, request: Request<FreezeFsRequest>) -> Result<Response<FreezeFsReply>, Status> {
        freeze_volume(&request.into_inner().volume_id)
            .await
            .map(|_| Response::new(FreezeFsReply {}))
            .map_err(service_error_to_status)
    }

    async fn unfreeze_fs(&self, request: Request<UnfreezeFsRequest>) -> Result<Response<UnfreezeFsReply>, Status> {
        unfreeze_volume(&request.into_inner().volume_id)
            .await
            .map(|_| Response::new(UnfreezeFsReply {}))
            .map_err(service_error_to_status)
    }

    async fn find_volume(&self, request: Request<FindVolumeRequest>) -> Result<Response<FindVolumeReply>, Status> {
        find_volume(&request.into_inner().volume_id)
            .await
            .map(|filesystem_type| Response::new(FindVolumeReply { filesystem_type }))
            .map_err(service_error_to_status)
    }
}
