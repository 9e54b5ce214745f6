//! Mounting and unmounting filesystems for the node publisher.

use std::collections::HashSet;
use std::io::Error;

use devinfo::mountinfo::{MountInfo, MountIter};
use sys_mount::{unmount, FilesystemType, Mount, MountFlags, UnmountFlags};
use tracing::{debug, info};

/// Checks if the readonly (ro) option is present in a "list" of options,
/// while allowing flexibility as to the type of "list".
pub(crate) trait ReadOnly {
    fn readonly(&self) -> bool;
}

impl ReadOnly for Vec<String> {
    fn readonly(&self) -> bool {
        self.iter().any(|entry| entry == "ro")
    }
}

impl ReadOnly for &str {
    fn readonly(&self) -> bool {
        self.split(',').any(|entry| entry == "ro")
    }
}

/// Return mountinfo matching source and/or destination.
pub(crate) fn find_mount(source: Option<&str>, target: Option<&str>) -> Option<MountInfo> {
    let mut found: Option<MountInfo> = None;

    for mount in MountIter::new().unwrap().flatten() {
        if let Some(value) = source {
            if mount.source.to_string_lossy() == value {
                if let Some(value) = target {
                    if mount.dest.to_string_lossy() == value {
                        found = Some(mount);
                    }
                    continue;
                }
                found = Some(mount);
            }
            continue;
        }
        if let Some(value) = target {
            if mount.dest.to_string_lossy() == value {
                found = Some(mount);
            }
        }
    }

    found.map(MountInfo::from)
}

/// Check if options in "first" are also present in "second", excluding
/// "ro"/"rw" from the comparison.
pub(crate) fn subset(first: &[String], second: &[String]) -> bool {
    let set: HashSet<&String> = second.iter().collect();
    for entry in first {
        if entry == "ro" || entry == "rw" {
            continue;
        }
        if set.get(entry).is_none() {
            return false;
        }
    }
    true
}

/// Filesystems the node plugin knows how to format and mount.
pub(crate) fn probe_filesystems() -> Vec<String> {
    vec![String::from("xfs"), String::from("ext4")]
}

fn parse(options: &[String]) -> (bool, String) {
    let mut list: Vec<&str> = Vec::new();
    let mut readonly = false;

    for entry in options {
        if entry == "ro" {
            readonly = true;
            continue;
        }
        if entry == "rw" {
            continue;
        }
        list.push(entry);
    }

    (readonly, list.join(","))
}

fn option(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn show(options: &[String]) -> String {
    let list: Vec<String> = options.iter().cloned().filter(|value| value != "rw").collect();

    if list.is_empty() {
        return String::from("none");
    }

    list.join(",")
}

/// Mount a device to a directory (mountpoint).
pub(crate) fn filesystem_mount(
    device: &str,
    target: &str,
    fstype: &str,
    options: &[String],
) -> Result<Mount, Error> {
    let mut flags = MountFlags::empty();

    let (readonly, value) = parse(options);

    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    let mount = Mount::new(device, target, FilesystemType::Manual(fstype), flags, option(&value))?;

    debug!(
        "filesystem ({}) on device {} mounted onto target {} (options: {})",
        fstype,
        device,
        target,
        show(options)
    );

    Ok(mount)
}

/// Unmount a device from a directory (mountpoint). Not for bind mounts.
pub(crate) fn filesystem_unmount(target: &str) -> Result<(), Error> {
    let mut flags = UnmountFlags::empty();
    flags.insert(UnmountFlags::DETACH);

    unmount(target, flags)?;

    debug!("target {} unmounted", target);

    Ok(())
}

/// Bind mount a source path to a target path. Supports both directories and files.
pub(crate) fn bind_mount(source: &str, target: &str, file: bool) -> Result<Mount, Error> {
    let mut flags = MountFlags::empty();
    flags.insert(MountFlags::BIND);

    if file {
        flags.insert(MountFlags::RDONLY);
    }

    let mount = Mount::new(source, target, FilesystemType::Manual("none"), flags, None)?;

    debug!("source {} bind mounted onto target {}", source, target);

    Ok(mount)
}

/// Bind remount a path to modify mount options. Assumes target is already bind mounted.
pub(crate) fn bind_remount(target: &str, options: &[String]) -> Result<Mount, Error> {
    let mut flags = MountFlags::empty();

    let (readonly, value) = parse(options);

    flags.insert(MountFlags::BIND);

    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    flags.insert(MountFlags::REMOUNT);

    let mount = Mount::new("none", target, FilesystemType::Manual("none"), flags, option(&value))?;

    debug!("target {} bind remounted (options: {})", target, show(options));

    Ok(mount)
}

/// Unmount a path that was previously bind mounted. Not for device mounts.
pub(crate) fn bind_unmount(target: &str) -> Result<(), Error> {
    let flags = UnmountFlags::empty();

    unmount(target, flags)?;

    info!("target {} bind unmounted", target);

    Ok(())
}
