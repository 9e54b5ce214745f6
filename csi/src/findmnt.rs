//! Stale-mount detection via the `findmnt` utility: given a device path or a
//! mount target, ask the kernel's mount table what's actually there rather
//! than trusting our own bookkeeping.

use std::collections::HashMap;
use std::process::Command;

use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::warn;

use crate::error::DeviceError;

const TARGET_KEY: &str = "target";
const SOURCE_KEY: &str = "source";
const FSTYPE_KEY: &str = "fstype";

#[derive(Debug)]
pub(crate) struct DeviceMount {
    pub mount_path: String,
    pub fstype: String,
}

#[derive(Debug)]
struct Filter<'a> {
    key: &'a str,
    value: &'a str,
}

static RE_UDEVPATH: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(?x).*\[(?P<device>/.*)\]\s*").unwrap());

/// Convert a json value of a key-value pair to a string, adjusted if
/// required on the key.
///
/// The source field returned from findmnt can differ for the same source
/// across systems, e.g. `dev[/nvme0n1]`, `udev[/nvme0n1]`, `tmpfs[/nvme0n1]`;
/// this normalizes those to `/dev/nvme0n1`.
fn key_adjusted_value(key: &str, value: &Value) -> String {
    let strvalue: String = match value {
        Value::String(s) => s.to_string(),
        _ => value.to_string(),
    };
    if key == SOURCE_KEY {
        if let Some(caps) = RE_UDEVPATH.captures(&strvalue) {
            return format!("/dev{}", &caps["device"]);
        }
    }
    strvalue
}

const KEYS: &[&str] = &[TARGET_KEY, SOURCE_KEY, FSTYPE_KEY];

fn jsonmap_to_hashmap(json_map: &serde_json::Map<String, Value>) -> HashMap<String, String> {
    let mut hmap = HashMap::new();
    for (key, value) in json_map {
        if KEYS.contains(&key.as_str()) {
            hmap.insert(key.clone(), key_adjusted_value(key, value));
        }
    }
    hmap
}

/// Recurse over the de-serialized JSON returned by findmnt, collecting
/// entries whose key-value pair matches the filter.
///
/// Deliberately generic (and hence slower) so it stays robust to future
/// changes in findmnt's output shape.
fn filter_findmnt(json_val: &Value, filter: &Filter, results: &mut Vec<HashMap<String, String>>) {
    match json_val {
        Value::Array(json_array) => {
            for jsonvalue in json_array {
                filter_findmnt(jsonvalue, filter, results);
            }
        }
        Value::Object(json_map) => {
            if let Some(value) = json_map.get(filter.key) {
                if filter.value == value || filter.value == key_adjusted_value(filter.key, value) {
                    results.push(jsonmap_to_hashmap(json_map));
                }
            }
            for jsonvalue in json_map.values() {
                if jsonvalue.is_array() {
                    filter_findmnt(jsonvalue, filter, results);
                }
            }
        }
        jvalue => {
            warn!("unexpected json type in findmnt output: {}", jvalue);
        }
    }
}

const FIND_MNT: &str = "findmnt";
const FIND_MNT_ARGS: [&str; 3] = ["-J", "-o", "SOURCE,TARGET,FSTYPE"];

fn findmnt(params: Filter) -> Result<Vec<HashMap<String, String>>, DeviceError> {
    let output = Command::new(FIND_MNT).args(FIND_MNT_ARGS).output()?;
    if output.status.success() {
        let json_str = String::from_utf8(output.stdout)?;
        let json: Value = serde_json::from_str(&json_str)?;
        let mut results = Vec::new();
        filter_findmnt(&json, &params, &mut results);
        Ok(results)
    } else {
        Err(DeviceError::Command {
            message: String::from_utf8(output.stderr)?,
        })
    }
}

/// Find the device mounted at `mount_path`, if any.
pub(crate) fn get_devicepath(mount_path: &str) -> Result<Option<String>, DeviceError> {
    let sources = findmnt(Filter {
        key: TARGET_KEY,
        value: mount_path,
    })?;

    match sources.len() {
        0 => Ok(None),
        1 => sources[0]
            .get(SOURCE_KEY)
            .cloned()
            .map(Some)
            .ok_or_else(|| DeviceError::Command {
                message: "missing source field".to_string(),
            }),
        _ => {
            warn!("multiple sources mounted on target {:?}->{}", sources, mount_path);
            Err(DeviceError::Command {
                message: format!("multiple devices mounted at {}", mount_path),
            })
        }
    }
}

/// Find the mount paths for `device_path`, if any.
pub(crate) fn get_mountpaths(device_path: &str) -> Result<Vec<DeviceMount>, DeviceError> {
    let results = findmnt(Filter {
        key: SOURCE_KEY,
        value: device_path,
    })?;

    let mut mountpaths = Vec::new();
    for entry in results {
        if let Some(mountpath) = entry.get(TARGET_KEY) {
            let fstype = entry.get(FSTYPE_KEY).cloned().unwrap_or_else(|| {
                warn!("missing fstype for {}", mountpath);
                "unspecified".to_string()
            });
            mountpaths.push(DeviceMount {
                mount_path: mountpath.clone(),
                fstype,
            });
        } else {
            warn!("missing target field {:?}", entry);
        }
    }
    Ok(mountpaths)
}
