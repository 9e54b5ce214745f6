//! Attaching and detaching block devices published over iSCSI or NVMe-oF.
//!
//! Attach and detach are not symmetric: attach is driven by the structured
//! fields in a volume's publish context (subsystem/target identifiers,
//! portal, lun), while detach on `NodeUnstageVolume` only has a volume id to
//! go on and must rediscover the device through udev.
//!
//! ```ignore
//! let device = iscsi::IscsiDevice::new(portal, iqn, lun);
//! if device.find().await?.is_none() {
//!     device.attach().await?;
//! }
//! let devname = Device::wait_for_device(&device, Duration::from_millis(500), 10).await?;
//! // ... later, on unstage, given only the CSI volume id:
//! if let Some(device) = Device::lookup(&volume_id).await? {
//!     device.detach().await?;
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::sleep;
use udev::Enumerator;
use uuid::Uuid;

pub(crate) mod iscsi;
pub(crate) mod nvmf;

use crate::error::DeviceError;
use crate::match_dev;
use crate::session::SubsystemKey;

pub(crate) type DeviceName = String;

/// The subsystem/target naming convention shared by the controller (which
/// generates these identifiers) and the node publisher (which parses them
/// back out of udev device paths to recover a volume id on detach).
pub(crate) const NQN_PREFIX: &str = "nqn.2019-10.io.csi-appliance";
pub(crate) const IQN_PREFIX: &str = "iqn.2019-10.io.csi-appliance";

/// CSI volume ids are dataset paths (`tank/csi/my-vol`), not UUIDs, and NQNs
/// and IQNs can't embed a path's slashes. `volume_uuid` derives a stable
/// per-path UUID (v5, so the same path always maps to the same value with
/// nothing to persist) used as the NQN/IQN suffix and as the udev matching
/// key, so the node publisher can recompute the same identifiers from a bare
/// volume id on `NodeUnstageVolume` without having stored anything itself.
pub(crate) fn volume_uuid(volume_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, volume_id.as_bytes())
}

pub(crate) fn subsystem_nqn(volume_id: &str) -> String {
    format!("{}:vol-{}", NQN_PREFIX, volume_uuid(volume_id))
}

pub(crate) fn target_iqn(volume_id: &str) -> String {
    format!("{}:vol-{}", IQN_PREFIX, volume_uuid(volume_id))
}

/// Recover the uuid embedded in a generated NQN/IQN suffix of the form
/// `vol-<uuid>`, used when reconstructing a `Detach` from a udev-matched
/// device path rather than from a known volume id.
pub(crate) fn extract_uuid(suffix: &str) -> Result<Uuid, DeviceError> {
    let stripped = suffix.strip_prefix("vol-").unwrap_or(suffix);
    Uuid::parse_str(stripped).map_err(|error| DeviceError::InvalidUri {
        reason: format!("'{}' does not embed a volume uuid: {}", suffix, error),
    })
}

#[async_trait::async_trait]
pub(crate) trait Attach: Sync + Send {
    async fn attach(&self) -> Result<(), DeviceError>;
    async fn find(&self) -> Result<Option<DeviceName>, DeviceError>;
}

#[async_trait::async_trait]
pub(crate) trait Detach: Sync + Send {
    async fn detach(&self) -> Result<(), DeviceError>;
    fn devname(&self) -> DeviceName;
}

pub(crate) struct Device;

impl Device {
    /// Look up a previously attached device in udev matching `volume_id`'s
    /// derived uuid, reconstructing whichever protocol's Detach
    /// implementation applies.
    pub(crate) async fn lookup(volume_id: &str) -> Result<Option<Box<dyn Detach>>, DeviceError> {
        let uuid = volume_uuid(volume_id);
        let nvmf_key = format!("uuid.{}", uuid);

        let mut enumerator = Enumerator::new().map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_subsystem("block")
            .map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_property("DEVTYPE", "disk")
            .map_err(|source| DeviceError::Udev { source })?;

        for device in enumerator.scan_devices().map_err(|source| DeviceError::Udev { source })? {
            if let Some((devname, path)) = match_dev::match_iscsi_device(&device) {
                let candidate = iscsi::IscsiDetach::from_path(devname.to_string(), path)?;
                if *candidate.uuid() == uuid {
                    return Ok(Some(Box::new(candidate)));
                }
                continue;
            }

            if let Some(devname) = match_dev::match_nvmf_device(&device, &nvmf_key) {
                let nqn = format!("{}:vol-{}", NQN_PREFIX, uuid);
                return Ok(Some(Box::new(nvmf::NvmfDetach::new(devname.to_string(), nqn))));
            }
        }

        Ok(None)
    }

    /// Every nvmf/iscsi session already attached on this node, counted by
    /// how many block devices udev reports against each subsystem/target
    /// identity. Used to seed the node publisher's in-memory session table
    /// on startup so a restart doesn't forget a session other staged
    /// volumes still depend on.
    pub(crate) async fn enumerate_sessions() -> Result<Vec<(SubsystemKey, u32)>, DeviceError> {
        let mut enumerator = Enumerator::new().map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_subsystem("block")
            .map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_property("DEVTYPE", "disk")
            .map_err(|source| DeviceError::Udev { source })?;

        let mut counts: HashMap<SubsystemKey, u32> = HashMap::new();
        for device in enumerator.scan_devices().map_err(|source| DeviceError::Udev { source })? {
            if let Some((_, path)) = match_dev::match_iscsi_device(&device) {
                if let Ok(key) = iscsi::IscsiDevice::session_key_from_path(path) {
                    *counts.entry(key).or_insert(0) += 1;
                }
                continue;
            }
            if let Some((_, wwn)) = match_dev::match_nvmf_device_any(&device) {
                *counts.entry(nvmf::session_key_from_wwn(wwn)).or_insert(0) += 1;
            }
        }

        Ok(counts.into_iter().collect())
    }

    /// Poll `find()` until the device shows up in udev or the retry budget
    /// is exhausted.
    pub(crate) async fn wait_for_device(
        device: &dyn Attach,
        interval: Duration,
        retries: u32,
    ) -> Result<DeviceName, DeviceError> {
        for _ in 0..=retries {
            if let Some(devname) = device.find().await? {
                return Ok(devname);
            }
            sleep(interval).await;
        }
        Err(DeviceError::AttachTimeout {
            elapsed: interval * retries,
        })
    }
}
