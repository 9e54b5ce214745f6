use once_cell::sync::Lazy;
use regex::Regex;
use udev::Enumerator;
use uuid::Uuid;

use super::{extract_uuid, Attach, Detach, DeviceError, DeviceName};
use crate::match_dev::match_iscsi_device;
use crate::session::SubsystemKey;

mod iscsiadm;
use iscsiadm::IscsiAdmin;

/// An iSCSI LUN identified by portal/IQN/LUN, as handed to the node
/// publisher in a volume's publish context.
pub(crate) struct IscsiDevice {
    portal: String,
    iqn: String,
    uuid: Uuid,
    lun: u16,
}

impl IscsiDevice {
    pub(crate) fn new(portal: String, iqn: String, lun: u16) -> Result<Self, DeviceError> {
        let suffix = iqn.rsplit(':').next().unwrap_or(&iqn);
        let uuid = extract_uuid(suffix)?;
        Ok(IscsiDevice { portal, iqn, uuid, lun })
    }

    fn to_path(&self) -> String {
        format!("ip-{}-iscsi-{}-lun-{}", self.portal, self.iqn, self.lun)
    }

    /// Recover the session identity from a udev `ID_PATH` value, for
    /// reconciling the node publisher's session table against whatever
    /// `iscsiadm` already shows as logged in at startup.
    pub(crate) fn session_key_from_path(path: &str) -> Result<SubsystemKey, DeviceError> {
        let device = IscsiDevice::from_path(path)?;
        Ok(SubsystemKey::iscsi(&device.portal, &device.iqn))
    }

    fn from_path(path: &str) -> Result<IscsiDevice, DeviceError> {
        static PATTERN: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^ip-(?P<host>[^:]+):(?P<port>[[:digit:]]+)-(?P<scheme>[[:alpha:]]+)-(?P<iqn>[[:alpha:]]+\.[[:digit:]]{4}-[[:digit:]]{2}\.[^:]+:(?P<suffix>[[:alnum:]]+(?:-[[:xdigit:]]+)+))-lun-(?P<lun>[[:digit:]]+)$").unwrap()
        });

        let captures = PATTERN.captures(path).ok_or_else(|| DeviceError::InvalidUri {
            reason: format!("malformed iscsi device path: {}", path),
        })?;

        let host = &captures["host"];
        let port = &captures["port"];
        let scheme = &captures["scheme"];
        let iqn = &captures["iqn"];
        let suffix = &captures["suffix"];
        let lun: u16 = captures["lun"].parse().map_err(|_| DeviceError::InvalidUri {
            reason: format!("invalid lun in device path: {}", path),
        })?;

        if scheme != "iscsi" {
            return Err(DeviceError::InvalidUri {
                reason: format!("unexpected scheme '{}' in device path: {}", scheme, path),
            });
        }

        let uuid = extract_uuid(suffix)?;

        Ok(IscsiDevice {
            portal: format!("{}:{}", host, port),
            iqn: iqn.to_string(),
            uuid,
            lun,
        })
    }
}

#[async_trait::async_trait]
impl Attach for IscsiDevice {
    async fn attach(&self) -> Result<(), DeviceError> {
        if IscsiAdmin::find_session(&self.portal, &self.iqn)? {
            return Ok(());
        }

        IscsiAdmin::discover(&self.portal, &self.iqn)?;

        if let Err(error) = IscsiAdmin::login(&self.portal, &self.iqn) {
            let _ = IscsiAdmin::delete(&self.portal, &self.iqn);
            return Err(error);
        }

        Ok(())
    }

    async fn find(&self) -> Result<Option<DeviceName>, DeviceError> {
        let key = self.to_path();

        let mut enumerator = Enumerator::new().map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_subsystem("block")
            .map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_property("DEVTYPE", "disk")
            .map_err(|source| DeviceError::Udev { source })?;

        for device in enumerator.scan_devices().map_err(|source| DeviceError::Udev { source })? {
            if let Some((devname, path)) = match_iscsi_device(&device) {
                if path == key {
                    return Ok(Some(devname.to_string()));
                }
            }
        }

        Ok(None)
    }
}

pub(crate) struct IscsiDetach {
    name: DeviceName,
    device: IscsiDevice,
}

impl IscsiDetach {
    pub(crate) fn from_path(name: DeviceName, path: &str) -> Result<IscsiDetach, DeviceError> {
        let device = IscsiDevice::from_path(path)?;
        Ok(IscsiDetach { name, device })
    }

    pub(crate) fn uuid(&self) -> &Uuid {
        &self.device.uuid
    }
}

#[async_trait::async_trait]
impl Detach for IscsiDetach {
    fn devname(&self) -> DeviceName {
        self.name.clone()
    }

    async fn detach(&self) -> Result<(), DeviceError> {
        IscsiAdmin::logout(&self.device.portal, &self.device.iqn)?;
        IscsiAdmin::delete(&self.device.portal, &self.device.iqn)?;
        Ok(())
    }
}
