//! Error taxonomy for the driver's controller and node publisher, and the
//! single mapping into `tonic::Status` at the CSI adapter boundary.

use snafu::Snafu;
use tonic::{Code, Status};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeviceError {
    #[snafu(display("unsupported device scheme: {}", scheme))]
    UnsupportedScheme { scheme: String },

    #[snafu(display("invalid device uri: {}", reason))]
    InvalidUri { reason: String },

    #[snafu(display("device attach timed out after {:?}", elapsed))]
    AttachTimeout { elapsed: std::time::Duration },

    #[snafu(display("iscsiadm command failed: {}", message))]
    Iscsiadm { message: String },

    #[snafu(display("nvme-oF operation failed: {}", message))]
    Nvmf { message: String },

    #[snafu(display("udev error: {}", source))]
    Udev { source: std::io::Error },

    #[snafu(display("io error: {}", source))]
    Io { source: std::io::Error },

    #[snafu(display("command produced invalid utf8: {}", source))]
    Utf8 { source: std::string::FromUtf8Error },

    #[snafu(display("malformed json from external command: {}", source))]
    Json { source: serde_json::Error },

    #[snafu(display("{}", message))]
    Command { message: String },
}

impl From<std::io::Error> for DeviceError {
    fn from(source: std::io::Error) -> Self {
        DeviceError::Io { source }
    }
}

impl From<std::string::FromUtf8Error> for DeviceError {
    fn from(source: std::string::FromUtf8Error) -> Self {
        DeviceError::Utf8 { source }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(source: serde_json::Error) -> Self {
        DeviceError::Json { source }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ControllerError {
    #[snafu(display("invalid argument: {}", message))]
    InvalidArgument { message: String },

    #[snafu(display("volume '{}' not found", id))]
    VolumeNotFound { id: String },

    #[snafu(display("volume '{}' already exists with incompatible parameters", name))]
    AlreadyExistsIncompatible { name: String },

    #[snafu(display("'{}' has dependent clones", id))]
    HasDependents { id: String },

    #[snafu(display(
        "requested size {} is smaller than content source size {}",
        requested,
        source_size
    ))]
    SourceTooSmall { requested: u64, source_size: u64 },

    #[snafu(display("appliance error: {}", source))]
    Appliance { source: appliance_api::ApplianceError },
}

impl From<appliance_api::ApplianceError> for ControllerError {
    fn from(source: appliance_api::ApplianceError) -> Self {
        ControllerError::Appliance { source }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PublishError {
    #[snafu(display("invalid argument: {}", message))]
    InvalidArgument { message: String },

    #[snafu(display("mount error at {}: {}", target, source))]
    Mount { target: String, source: std::io::Error },

    #[snafu(display("device error: {}", source))]
    Device { source: DeviceError },

    #[snafu(display("device did not appear within deadline"))]
    DeviceTimeout,

    #[snafu(display("format error: {}", message))]
    Format { message: String },

    #[snafu(display("appliance error: {}", source))]
    Appliance { source: appliance_api::ApplianceError },
}

impl From<DeviceError> for PublishError {
    fn from(source: DeviceError) -> Self {
        PublishError::Device { source }
    }
}

impl From<appliance_api::ApplianceError> for PublishError {
    fn from(source: appliance_api::ApplianceError) -> Self {
        PublishError::Appliance { source }
    }
}

/// The single conversion point from our internal error taxonomy into a
/// gRPC status; no other module constructs a `tonic::Status`.
pub fn controller_error_to_status(err: ControllerError) -> Status {
    use appliance_api::ApplianceError;
    match err {
        ControllerError::InvalidArgument { message } => Status::new(Code::InvalidArgument, message),
        ControllerError::VolumeNotFound { id } => {
            Status::new(Code::NotFound, format!("volume '{}' not found", id))
        }
        ControllerError::AlreadyExistsIncompatible { name } => Status::new(
            Code::AlreadyExists,
            format!("'{}' already exists with different parameters", name),
        ),
        ControllerError::HasDependents { id } => {
            Status::new(Code::FailedPrecondition, format!("'{}' has dependent clones", id))
        }
        ControllerError::SourceTooSmall { requested, source_size } => Status::new(
            Code::InvalidArgument,
            format!("requested size {} smaller than source size {}", requested, source_size),
        ),
        ControllerError::Appliance { source } => appliance_error_to_status(source),
    }
}

pub fn publish_error_to_status(err: PublishError) -> Status {
    match err {
        PublishError::InvalidArgument { message } => Status::new(Code::InvalidArgument, message),
        PublishError::Mount { target, source } => {
            Status::new(Code::Internal, format!("mount failed at {}: {}", target, source))
        }
        PublishError::Device { source } => Status::new(Code::Internal, source.to_string()),
        PublishError::DeviceTimeout => Status::new(Code::DeadlineExceeded, "device did not appear in time"),
        PublishError::Format { message } => Status::new(Code::Internal, message),
        PublishError::Appliance { source } => appliance_error_to_status(source),
    }
}

fn appliance_error_to_status(err: appliance_api::ApplianceError) -> Status {
    use appliance_api::ApplianceError;
    match err {
        ApplianceError::AlreadyExists { kind, name } => {
            Status::new(Code::AlreadyExists, format!("{} '{}' already exists", kind, name))
        }
        ApplianceError::NotFound { kind, name } => {
            Status::new(Code::NotFound, format!("{} '{}' not found", kind, name))
        }
        ApplianceError::InvalidArgument { message } => Status::new(Code::InvalidArgument, message),
        ApplianceError::Conflict { kind, name } => {
            Status::new(Code::FailedPrecondition, format!("{} '{}' is in use", kind, name))
        }
        ApplianceError::Unavailable { message } => Status::new(Code::Unavailable, message),
        ApplianceError::UnknownProperty { key } => {
            Status::new(Code::InvalidArgument, format!("unknown property '{}'", key))
        }
        ApplianceError::Transport { source } => Status::new(Code::Unavailable, source.to_string()),
        ApplianceError::Internal { message } => Status::new(Code::Internal, message),
    }
}
