use nvmeadm::nvmf_discovery::DiscoveryBuilder;
use udev::Enumerator;
use uuid::Uuid;

use super::{extract_uuid, Attach, Detach, DeviceError, DeviceName, NQN_PREFIX};
use crate::match_dev::match_nvmf_device;
use crate::session::SubsystemKey;

/// An NVMe-oF/TCP namespace identified by host/port/NQN, as handed to the
/// node publisher in a volume's publish context.
pub(crate) struct NvmfDevice {
    host: String,
    port: u16,
    uuid: Uuid,
    nqn: String,
}

impl NvmfDevice {
    pub(crate) fn new(host: String, port: u16, nqn: String) -> Result<Self, DeviceError> {
        let suffix = nqn.rsplit(':').next().unwrap_or(&nqn);
        let uuid = extract_uuid(suffix)?;
        Ok(NvmfDevice { host, port, uuid, nqn })
    }
}

#[async_trait::async_trait]
impl Attach for NvmfDevice {
    async fn attach(&self) -> Result<(), DeviceError> {
        let mut discovery = DiscoveryBuilder::default()
            .transport("tcp".to_string())
            .traddr(self.host.clone())
            .trsvcid(self.port as u32)
            .build()
            .map_err(|error| DeviceError::Nvmf { message: error.to_string() })?;

        discovery.discover().map_err(|source| DeviceError::Nvmf { message: source.to_string() })?;
        discovery
            .connect(&self.nqn)
            .map(|_| ())
            .map_err(|source| DeviceError::Nvmf { message: source.to_string() })
    }

    async fn find(&self) -> Result<Option<DeviceName>, DeviceError> {
        let key = format!("uuid.{}", self.uuid);

        let mut enumerator = Enumerator::new().map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_subsystem("block")
            .map_err(|source| DeviceError::Udev { source })?;
        enumerator
            .match_property("DEVTYPE", "disk")
            .map_err(|source| DeviceError::Udev { source })?;

        for device in enumerator.scan_devices().map_err(|source| DeviceError::Udev { source })? {
            if let Some(devname) = match_nvmf_device(&device, &key) {
                return Ok(Some(devname.to_string()));
            }
        }

        Ok(None)
    }
}

/// Recover the session identity from a udev `ID_WWN` value (`uuid.<uuid>`),
/// for reconciling the node publisher's session table against whatever
/// already shows connected at startup.
pub(crate) fn session_key_from_wwn(wwn: &str) -> SubsystemKey {
    let uuid = wwn.strip_prefix("uuid.").unwrap_or(wwn);
    SubsystemKey::nvmf(&format!("{}:vol-{}", NQN_PREFIX, uuid))
}

pub(crate) struct NvmfDetach {
    name: DeviceName,
    nqn: String,
}

impl NvmfDetach {
    pub(crate) fn new(name: DeviceName, nqn: String) -> NvmfDetach {
        NvmfDetach { name, nqn }
    }
}

#[async_trait::async_trait]
impl Detach for NvmfDetach {
    async fn detach(&self) -> Result<(), DeviceError> {
        let disconnected = nvmeadm::nvmf_discovery::disconnect(&self.nqn)
            .map_err(|source| DeviceError::Nvmf { message: source.to_string() })?;
        if disconnected == 0 {
            return Err(DeviceError::Nvmf {
                message: format!("nvmf disconnect {}: no device found", self.nqn),
            });
        }
        Ok(())
    }

    fn devname(&self) -> DeviceName {
        self.name.clone()
    }
}
