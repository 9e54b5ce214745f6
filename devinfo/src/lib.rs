//! Mount-table and partition-identity lookups used by the node publisher to
//! detect existing mounts and resolve `/dev/disk/by-*` style paths.
pub mod mountinfo;
pub mod partition;
