//! Formatting a block device with a filesystem, if it doesn't already carry one.

use std::process::Command;

use blkid::probe::Probe;
use tracing::{debug, info, trace};

use crate::error::{FormatSnafu, PublishError};

/// Probe the device for an existing filesystem; if there is one, leave it as
/// is. We never check whether the existing filesystem matches what was
/// requested — the rule is "never overwrite or delete data".
pub(crate) async fn probed_format(device: &str, fstype: &str) -> Result<(), PublishError> {
    let probe = Probe::new_from_filename(device).map_err(|_| PublishError::Format {
        message: format!("failed to init probing for {}", device),
    })?;

    if probe.do_probe().is_err() {
        return Err(PublishError::Format {
            message: format!("failed to probe device {}", device),
        });
    }

    // blkid fills in the value of the TYPE property or returns NULL on
    // failure; lookup_value returning Err here means no such property, i.e.
    // no filesystem on the device.
    match probe.lookup_value("TYPE") {
        Err(_) => {
            debug!("formatting device {} with a {} filesystem", device, fstype);
            let output = Command::new(format!("mkfs.{}", fstype))
                .arg(device)
                .output()
                .map_err(|e| PublishError::Format {
                    message: format!("failed to execute mkfs.{}: {}", fstype, e),
                })?;
            trace!(
                "mkfs.{} stdout: {}",
                fstype,
                String::from_utf8_lossy(&output.stdout)
            );
            if !output.status.success() {
                return FormatSnafu {
                    message: format!(
                        "failed to format {} with {} fs: {}",
                        device,
                        fstype,
                        String::from_utf8_lossy(&output.stderr)
                    ),
                }
                .fail();
            }
            info!("device {} formatted with {} filesystem", device, fstype);
        }
        Ok(fs) => {
            info!(
                "skipping format: device {} already contains a {} filesystem",
                device, fs
            );
        }
    }

    Ok(())
}
