use crate::models::device::DriveClass;
use serde::Serialize;

/// A drive backing the storage pool. `shared` means the drive also holds
/// volume-group data outside the pool's own logical volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolDevice {
    pub path:       String,
    pub sort_index: u64,
    pub name:       String,
    pub class:      DriveClass,
    pub size:       u64,
    pub shared:     bool,
}

/// A drive present on the system but not part of the pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtraDevice {
    pub path:       String,
    pub sort_index: u64,
    pub name:       String,
    pub class:      DriveClass,
    pub size:       u64,
}

/// The unit of change detection. One of these is derived per poll cycle
/// and emitted as a JSON line only when it differs structurally from the
/// previously emitted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub can_manage:    bool,
    pub driver:        String,
    pub vgroup:        Option<String>,
    pub total:         u64,
    pub used:          u64,
    pub pool_devices:  Vec<PoolDevice>,
    pub extra_devices: Vec<ExtraDevice>,
}
