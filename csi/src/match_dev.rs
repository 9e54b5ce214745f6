//! Matching a udev record against a known device type.

use udev::Device;

macro_rules! require {
    (let $name:ident = $attribute:expr) => {
        let $name = match $attribute {
            Some(outer) => match outer.to_str() {
                Some(inner) => inner,
                None => {
                    return None;
                }
            },
            None => {
                return None;
            }
        };
    };
    ($value:ident == $attribute:expr) => {
        match $attribute {
            Some(outer) => match outer.to_str() {
                Some(inner) => {
                    if $value != inner {
                        return None;
                    }
                }
                None => {
                    return None;
                }
            },
            None => {
                return None;
            }
        }
    };
    ($value:literal == $attribute:expr) => {
        match $attribute {
            Some(outer) => match outer.to_str() {
                Some(inner) => {
                    if $value != inner {
                        return None;
                    }
                }
                None => {
                    return None;
                }
            },
            None => {
                return None;
            }
        }
    };
}

pub(crate) fn match_iscsi_device(device: &Device) -> Option<(&str, &str)> {
    require!("appliance-iscsi" == device.property_value("ID_MODEL"));
    require!("scsi" == device.property_value("ID_BUS"));

    require!(let devname = device.property_value("DEVNAME"));
    require!(let path = device.property_value("ID_PATH"));

    Some((devname, path))
}

pub(crate) fn match_nvmf_device<'a>(device: &'a Device, key: &str) -> Option<&'a str> {
    require!("appliance NVMe controller" == device.property_value("ID_MODEL"));
    require!(key == device.property_value("ID_WWN"));

    require!(let devname = device.property_value("DEVNAME"));

    Some(devname)
}

/// Same model check as `match_nvmf_device`, but without pinning to a known
/// `ID_WWN` — used to enumerate every attached appliance NVMe-oF namespace
/// at startup rather than look up one specific volume's device.
pub(crate) fn match_nvmf_device_any(device: &Device) -> Option<(&str, &str)> {
    require!("appliance NVMe controller" == device.property_value("ID_MODEL"));

    require!(let devname = device.property_value("DEVNAME"));
    require!(let wwn = device.property_value("ID_WWN"));

    Some((devname, wwn))
}
