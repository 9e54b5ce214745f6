//! Thin wrapper around the `iscsiadm` command line tool.

use std::env;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use super::DeviceError;

pub(crate) struct IscsiAdmin;

impl IscsiAdmin {
    pub(crate) fn find_session(portal: &str, iqn: &str) -> Result<bool, DeviceError> {
        const ARGS: [&str; 2] = ["--mode", "session"];

        let iscsiadm = IscsiAdmin::get_binary()?;

        trace!("iscsiadm {:?}", &ARGS);

        let output = Command::new(iscsiadm).args(ARGS).output()?;

        if output.status.success() {
            return Ok(IscsiAdmin::find_target(portal, iqn, output.stdout));
        }

        // Exit code 21 is ISCSI_ERR_NO_OBJS_FOUND: no sessions exist yet,
        // which is not an error.
        if output.status.code() == Some(21) {
            return Ok(false);
        }

        Err(DeviceError::Iscsiadm {
            message: String::from_utf8(output.stderr)?,
        })
    }

    pub(crate) fn discover(portal: &str, iqn: &str) -> Result<(), DeviceError> {
        let iscsiadm = IscsiAdmin::get_binary()?;

        let args = [
            "--mode",
            "discovery",
            "--type",
            "sendtargets",
            "--portal",
            portal,
            "--interface",
            "default",
        ];

        trace!("iscsiadm {:?}", &args);

        let output = Command::new(iscsiadm).args(args).output()?;

        if output.status.success() {
            if IscsiAdmin::find_target(portal, iqn, output.stdout) {
                return Ok(());
            }
            return Err(DeviceError::Iscsiadm {
                message: format!("no record for target {}", iqn),
            });
        }

        Err(DeviceError::Iscsiadm {
            message: String::from_utf8(output.stderr)?,
        })
    }

    pub(crate) fn login(portal: &str, iqn: &str) -> Result<(), DeviceError> {
        let args = [
            "--mode",
            "node",
            "--targetname",
            iqn,
            "--portal",
            portal,
            "--interface",
            "default",
            "--login",
        ];
        IscsiAdmin::execute(&args)
    }

    pub(crate) fn logout(portal: &str, iqn: &str) -> Result<(), DeviceError> {
        let args = ["--mode", "node", "--targetname", iqn, "--portal", portal, "--logout"];
        IscsiAdmin::execute(&args)
    }

    pub(crate) fn delete(portal: &str, iqn: &str) -> Result<(), DeviceError> {
        let args = [
            "--mode",
            "node",
            "--targetname",
            iqn,
            "--portal",
            portal,
            "--interface",
            "default",
            "--op",
            "delete",
        ];
        IscsiAdmin::execute(&args)
    }

    fn execute(args: &[&str]) -> Result<(), DeviceError> {
        let iscsiadm = IscsiAdmin::get_binary()?;

        trace!("iscsiadm {:?}", args);

        let output = Command::new(iscsiadm).args(args).output()?;

        if output.status.success() {
            return Ok(());
        }

        Err(DeviceError::Iscsiadm {
            message: String::from_utf8(output.stderr)?,
        })
    }

    fn find_target(portal: &str, iqn: &str, data: Vec<u8>) -> bool {
        static PATTERN: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?P<portal>[[:digit:]]+(\.[[:digit:]]+){3}:[[:digit:]]+),[[:digit:]]+ +(?P<target>iqn\.[^ ]+)").unwrap()
        });

        let text = String::from_utf8_lossy(&data);
        for line in text.split('\n') {
            if let Some(captures) = PATTERN.captures(line) {
                if &captures["portal"] == portal && &captures["target"] == iqn {
                    return true;
                }
            }
        }

        false
    }

    fn get_binary() -> Result<String, DeviceError> {
        static ISCSIADM: Lazy<Option<String>> = Lazy::new(|| {
            if let Ok(path) = env::var("ISCSIADM") {
                debug!("using environment: ISCSIADM={}", &path);
                return Some(path);
            }
            if which::which("iscsiadm").is_ok() {
                debug!("using iscsiadm from PATH");
                return Some("iscsiadm".to_string());
            }
            debug!("iscsiadm binary not found");
            None
        });

        ISCSIADM.clone().ok_or(DeviceError::Iscsiadm {
            message: "iscsiadm binary not found".to_string(),
        })
    }
}
