//! Validates and normalizes the parameter map supplied by a StorageClass or
//! SnapshotClass.

use crate::error::ApplianceError;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Nfs,
    NvmeTcp,
    Iscsi,
}

impl std::str::FromStr for Protocol {
    type Err = ApplianceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nfs" => Ok(Protocol::Nfs),
            "nvmeof" => Ok(Protocol::NvmeTcp),
            "iscsi" => Ok(Protocol::Iscsi),
            other => Err(ApplianceError::InvalidArgument {
                message: format!("unknown protocol '{}'", other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteStrategy {
    Delete,
    Retain,
}

impl Default for DeleteStrategy {
    fn default() -> Self {
        DeleteStrategy::Delete
    }
}

#[derive(Debug, Clone)]
pub struct VolumeParameters {
    pub protocol: Protocol,
    pub pool: String,
    pub parent_dataset: Option<String>,
    pub server: Option<String>,
    pub transport: Option<String>,
    pub port: Option<u16>,
    pub fs_type: Option<String>,
    pub delete_strategy: DeleteStrategy,
    pub name_template: Option<String>,
    pub name_prefix: Option<String>,
    pub name_suffix: Option<String>,
    pub detached: bool,
    pub detached_snapshots: bool,
    pub detached_snapshots_parent_dataset: Option<String>,
    pub adopt_existing: bool,
    pub mark_adoptable: bool,
    pub encryption: bool,
    pub encryption_algorithm: Option<String>,
    pub encryption_generate_key: bool,
    pub zfs_properties: HashMap<String, String>,
}

/// Keys understood outside the `zfs.*` pass-through namespace. Anything else
/// is rejected before a single network call is made.
const KNOWN_KEYS: &[&str] = &[
    "protocol",
    "pool",
    "parent_dataset",
    "server",
    "transport",
    "port",
    "fs_type",
    "delete_strategy",
    "name_template",
    "name_prefix",
    "name_suffix",
    "detached",
    "detached_snapshots",
    "detached_snapshots_parent_dataset",
    "adopt_existing",
    "mark_adoptable",
    "encryption",
    "encryption_algorithm",
    "encryption_generate_key",
];

/// Block protocols always carry `fs_type`: the driver only ever formats and
/// mounts a filesystem on top of the attached device, never a raw bind-mount.
fn requires_fs_type(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::NvmeTcp | Protocol::Iscsi)
}

pub fn parse_volume_parameters(
    raw: &HashMap<String, String>,
) -> Result<VolumeParameters, ApplianceError> {
    for key in raw.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) && !key.starts_with("zfs.") {
            return Err(ApplianceError::UnknownProperty { key: key.clone() });
        }
    }

    let protocol: Protocol = raw
        .get("protocol")
        .ok_or_else(|| ApplianceError::InvalidArgument {
            message: "missing required parameter 'protocol'".into(),
        })?
        .parse()?;

    let pool = raw
        .get("pool")
        .ok_or_else(|| ApplianceError::InvalidArgument {
            message: "missing required parameter 'pool'".into(),
        })?
        .clone();

    let fs_type = raw.get("fs_type").cloned();
    if requires_fs_type(protocol) && fs_type.is_none() {
        return Err(ApplianceError::InvalidArgument {
            message: format!("fs_type is required for protocol {:?}", protocol),
        });
    }

    let delete_strategy = match raw.get("delete_strategy").map(String::as_str) {
        None | Some("delete") => DeleteStrategy::Delete,
        Some("retain") => DeleteStrategy::Retain,
        Some(other) => {
            return Err(ApplianceError::InvalidArgument {
                message: format!("invalid delete_strategy '{}'", other),
            })
        }
    };

    let port = match raw.get("port") {
        Some(p) => Some(p.parse::<u16>().map_err(|_| ApplianceError::InvalidArgument {
            message: format!("invalid port '{}'", p),
        })?),
        None => None,
    };

    let zfs_properties = raw
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("zfs.").map(|stripped| (stripped.to_string(), v.clone())))
        .collect();

    Ok(VolumeParameters {
        protocol,
        pool,
        parent_dataset: raw.get("parent_dataset").cloned(),
        server: raw.get("server").cloned(),
        transport: raw.get("transport").cloned(),
        port,
        fs_type,
        delete_strategy,
        name_template: raw.get("name_template").cloned(),
        name_prefix: raw.get("name_prefix").cloned(),
        name_suffix: raw.get("name_suffix").cloned(),
        detached: parse_bool(raw, "detached"),
        detached_snapshots: parse_bool(raw, "detached_snapshots"),
        detached_snapshots_parent_dataset: raw.get("detached_snapshots_parent_dataset").cloned(),
        adopt_existing: parse_bool(raw, "adopt_existing"),
        mark_adoptable: parse_bool(raw, "mark_adoptable"),
        encryption: parse_bool(raw, "encryption"),
        encryption_algorithm: raw.get("encryption_algorithm").cloned(),
        encryption_generate_key: parse_bool(raw, "encryption_generate_key"),
        zfs_properties,
    })
}

fn parse_bool(raw: &HashMap<String, String>, key: &str) -> bool {
    raw.get(key).map(|v| v == "true").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn rejects_unknown_key() {
        let raw = map(&[("protocol", "nfs"), ("pool", "tank"), ("bogus", "1")]);
        assert!(parse_volume_parameters(&raw).is_err());
    }

    #[test]
    fn block_protocol_requires_fs_type() {
        let raw = map(&[("protocol", "iscsi"), ("pool", "tank")]);
        assert!(parse_volume_parameters(&raw).is_err());

        let raw = map(&[("protocol", "iscsi"), ("pool", "tank"), ("fs_type", "ext4")]);
        assert!(parse_volume_parameters(&raw).is_ok());
    }

    #[test]
    fn nfs_does_not_require_fs_type() {
        let raw = map(&[("protocol", "nfs"), ("pool", "tank")]);
        assert!(parse_volume_parameters(&raw).is_ok());
    }

    #[test]
    fn zfs_passthrough_properties_are_collected() {
        let raw = map(&[
            ("protocol", "nfs"),
            ("pool", "tank"),
            ("zfs.compression", "lz4"),
            ("zfs.recordsize", "128k"),
        ]);
        let parsed = parse_volume_parameters(&raw).unwrap();
        assert_eq!(parsed.zfs_properties.get("compression").unwrap(), "lz4");
        assert_eq!(parsed.zfs_properties.get("recordsize").unwrap(), "128k");
    }
}
