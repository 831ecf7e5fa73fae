use crate::collectors::{driver, lvm, udev, usage};
use crate::models::device::Drive;
use crate::models::snapshot::{ExtraDevice, PoolDevice, PoolSnapshot};
use crate::{IMAGE_ROOT, STORAGE_CONFIG};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Volume-group state feeding pool-membership classification.
#[derive(Debug, Clone, Default)]
pub struct VgState {
    pub name: String,
    /// LV backing the active storage driver.
    pub pool_lv: String,
    /// Physical volume node -> parent drive kernel names.
    pub pv_parents: BTreeMap<String, Vec<String>>,
    /// Parent drive kernel names of every other LV in the group
    /// (excluding the pool LV and thin volumes allocated from it),
    /// keyed by LV name. A pool member is "shared" when one of these
    /// also claims its parent drive.
    pub other_lv_parents: BTreeMap<String, Vec<String>>,
}

/// Everything snapshot derivation needs, gathered up front so the
/// classification itself is a pure function.
#[derive(Debug, Clone, Default)]
pub struct PoolInputs {
    pub can_manage: bool,
    pub driver:     String,
    pub vg:         Option<VgState>,
    pub total:      u64,
    pub used:       u64,
    /// Kernel name -> drive, for every device passing the drive predicate.
    pub drives:     BTreeMap<String, Drive>,
}

/// Classify drives into pool members and extras and assemble the
/// snapshot. Every drive lands in exactly one of the two lists.
pub fn derive(inputs: &PoolInputs) -> PoolSnapshot {
    let mut pool_devices = Vec::new();
    let mut claimed: BTreeSet<&str> = BTreeSet::new();

    if let Some(vg) = &inputs.vg {
        let other: BTreeSet<&str> = vg
            .other_lv_parents
            .values()
            .flat_map(|parents| parents.iter().map(|s| s.as_str()))
            .collect();

        for parents in vg.pv_parents.values() {
            for name in parents {
                if !claimed.insert(name) {
                    continue; // two PVs on one drive still list it once
                }
                if let Some(drive) = inputs.drives.get(name) {
                    pool_devices.push(PoolDevice {
                        path:       drive.path.display().to_string(),
                        sort_index: drive.sort_index,
                        name:       drive.display.clone(),
                        class:      drive.class,
                        size:       drive.size,
                        shared:     other.contains(name.as_str()),
                    });
                }
            }
        }
    }

    let mut extra_devices: Vec<ExtraDevice> = inputs
        .drives
        .values()
        .filter(|d| !claimed.contains(d.name.as_str()))
        .map(|d| ExtraDevice {
            path:       d.path.display().to_string(),
            sort_index: d.sort_index,
            name:       d.display.clone(),
            class:      d.class,
            size:       d.size,
        })
        .collect();

    pool_devices.sort_by_key(|d| d.sort_index);
    extra_devices.sort_by_key(|d| d.sort_index);

    PoolSnapshot {
        can_manage: inputs.can_manage,
        driver:     inputs.driver.clone(),
        vgroup:     inputs.vg.as_ref().map(|vg| vg.name.clone()),
        total:      inputs.total,
        used:       inputs.used,
        pool_devices,
        extra_devices,
    }
}

/// Gather the full pool state from the live system. Any failure makes
/// the whole snapshot unavailable for this cycle; the caller keeps its
/// previous baseline.
pub fn collect(can_manage: bool) -> Result<PoolSnapshot> {
    let sysfs = Path::new("/sys");
    let image_root = Path::new(IMAGE_ROOT);

    let devices = udev::list_block_devices()?;
    let drives: BTreeMap<String, Drive> = devices
        .iter()
        .filter(|d| d.is_drive())
        .map(|d| (d.name.clone(), Drive::from_device(d)))
        .collect();

    let driver_name = driver::storage_driver();
    let backing = backing_lv(&driver_name, image_root)?;

    let mut vg_state = None;
    let mut lv_size = None;
    if let Some((vg, lv)) = &backing {
        let lvs: Vec<lvm::Lv> = lvm::read_lvs()?
            .into_iter()
            .filter(|l| &l.vg == vg)
            .collect();
        lv_size = lvs.iter().find(|l| &l.name == lv).map(|l| l.size);

        let mut pv_parents = BTreeMap::new();
        for pv in lvm::read_pvs()?.iter().filter(|p| &p.vg == vg) {
            if let Some(kname) = kernel_name(&pv.name) {
                pv_parents.insert(pv.name.clone(), lvm::physical_parents(&kname, sysfs));
            }
        }

        let mut other_lv_parents = BTreeMap::new();
        for other in lvs
            .iter()
            .filter(|l| &l.name != lv && l.pool_lv.as_deref() != Some(lv.as_str()))
        {
            let node = format!("/dev/{}/{}", vg, other.name);
            if let Some(kname) = kernel_name(&node) {
                other_lv_parents.insert(other.name.clone(), lvm::physical_parents(&kname, sysfs));
            }
        }

        vg_state = Some(VgState {
            name:    vg.clone(),
            pool_lv: lv.clone(),
            pv_parents,
            other_lv_parents,
        });
    }

    let (total, used) = if driver_name == "devicemapper" {
        match &backing {
            Some((vg, lv)) => {
                let used = lvm::thin_pool_usage(vg, lv)?;
                let total = adjusted_lv_size(lv_size.unwrap_or(0), vg)?;
                (total, used)
            }
            None => (0, 0),
        }
    } else {
        let used = usage::layer_db_usage(image_root);
        let fs_stat = usage::statvfs(image_root)?;
        let capacity = match (&backing, lv_size) {
            (Some((vg, _)), Some(size)) => Some(adjusted_lv_size(size, vg)?),
            _ => None,
        };
        (usage::filesystem_total(capacity, fs_stat, used), used)
    };

    Ok(derive(&PoolInputs {
        can_manage,
        driver: driver_name,
        vg: vg_state,
        total,
        used,
        drives,
    }))
}

/// The (vg, lv) backing the active driver: the configured thin pool for
/// devicemapper, else the LV under the image store's filesystem.
fn backing_lv(driver_name: &str, image_root: &Path) -> Result<Option<(String, String)>> {
    if driver_name == "devicemapper" {
        let pool = fs::read_to_string(STORAGE_CONFIG)
            .ok()
            .and_then(|text| driver::thinpooldev_from(&text));
        return Ok(pool
            .as_deref()
            .and_then(|dev| Path::new(dev).file_name())
            .and_then(|dm| lvm::split_dm_name(&dm.to_string_lossy())));
    }
    match driver::image_store_device(image_root)? {
        Some(dev) => Ok(lvm::lv_for_device(&dev)?.map(|(lv, vg)| (vg, lv))),
        None => Ok(None),
    }
}

/// A thin pool with an autoextend threshold under 100% will grow into
/// the VG's free space, so count that space as capacity.
fn adjusted_lv_size(lv_size: u64, vg: &str) -> Result<u64> {
    if lvm::autoextend_threshold() < 100 {
        Ok(lv_size + lvm::vg_free(vg)?)
    } else {
        Ok(lv_size)
    }
}

/// Kernel name of a device node, resolving symlinks like /dev/vg/lv.
fn kernel_name(node: &str) -> Option<String> {
    let path = fs::canonicalize(node).unwrap_or_else(|_| node.into());
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::DriveClass;
    use std::path::PathBuf;

    fn drive(name: &str, index: u64) -> (String, Drive) {
        (
            name.to_string(),
            Drive {
                path:       PathBuf::from(format!("/dev/{}", name)),
                name:       name.to_string(),
                sort_index: index,
                display:    name.to_uppercase(),
                class:      DriveClass::Sdd,
                size:       1 << 30,
            },
        )
    }

    fn inputs(vg: Option<VgState>) -> PoolInputs {
        PoolInputs {
            can_manage: false,
            driver: "devicemapper".into(),
            vg,
            total: 100,
            used: 10,
            drives: [drive("sda", 800_000), drive("sdb", 800_016), drive("sdc", 800_032)]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn no_vgroup_means_everything_is_extra() {
        let snap = derive(&inputs(None));
        assert!(snap.pool_devices.is_empty());
        assert_eq!(snap.extra_devices.len(), 3);
        assert!(snap.vgroup.is_none());
    }

    #[test]
    fn shared_flag_marks_drives_backing_other_lvs() {
        let vg = VgState {
            name: "docker-vg".into(),
            pool_lv: "pool00".into(),
            pv_parents: [
                ("/dev/sda2".to_string(), vec!["sda".to_string()]),
                ("/dev/sdb1".to_string(), vec!["sdb".to_string()]),
            ]
            .into_iter()
            .collect(),
            other_lv_parents: [("swap".to_string(), vec!["sda".to_string()])]
                .into_iter()
                .collect(),
        };
        let snap = derive(&inputs(Some(vg)));
        assert_eq!(snap.vgroup.as_deref(), Some("docker-vg"));
        assert_eq!(snap.pool_devices.len(), 2);
        assert!(snap.pool_devices[0].shared);  // sda also backs swap
        assert!(!snap.pool_devices[1].shared);
        assert_eq!(snap.extra_devices.len(), 1);
        assert_eq!(snap.extra_devices[0].path, "/dev/sdc");
    }

    #[test]
    fn one_drive_behind_two_pvs_is_listed_once() {
        let vg = VgState {
            name: "vg0".into(),
            pool_lv: "pool".into(),
            pv_parents: [
                ("/dev/sda1".to_string(), vec!["sda".to_string()]),
                ("/dev/sda2".to_string(), vec!["sda".to_string()]),
            ]
            .into_iter()
            .collect(),
            other_lv_parents: BTreeMap::new(),
        };
        let snap = derive(&inputs(Some(vg)));
        assert_eq!(snap.pool_devices.len(), 1);
        assert_eq!(snap.extra_devices.len(), 2);
    }

    #[test]
    fn unknown_parents_do_not_invent_devices() {
        let vg = VgState {
            name: "vg0".into(),
            pool_lv: "pool".into(),
            pv_parents: [("/dev/loop7".to_string(), vec!["loop7".to_string()])]
                .into_iter()
                .collect(),
            other_lv_parents: BTreeMap::new(),
        };
        let snap = derive(&inputs(Some(vg)));
        assert!(snap.pool_devices.is_empty());
        assert_eq!(snap.extra_devices.len(), 3);
    }

    #[test]
    fn device_lists_are_ordered_by_sort_index() {
        let vg = VgState {
            name: "vg0".into(),
            pool_lv: "pool".into(),
            pv_parents: [
                ("/dev/sdc1".to_string(), vec!["sdc".to_string()]),
                ("/dev/sda1".to_string(), vec!["sda".to_string()]),
            ]
            .into_iter()
            .collect(),
            other_lv_parents: BTreeMap::new(),
        };
        let snap = derive(&inputs(Some(vg)));
        assert_eq!(snap.pool_devices[0].path, "/dev/sda");
        assert_eq!(snap.pool_devices[1].path, "/dev/sdc");
    }
}
