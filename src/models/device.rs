use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveClass {
    Hdd,
    Sdd,
    Drive,
}

/// One block device as enumerated from the udev database.
/// Built fresh on every poll; never mutated after construction.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub node:       PathBuf,
    pub syspath:    PathBuf,
    pub name:       String,
    pub properties: HashMap<String, String>,
    pub size:       u64,
}

impl BlockDevice {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    /// Whether this device is a drive we should surface: a whole disk
    /// with a persistent vendor/path identity, a virtio disk, or a
    /// hypervisor-provided disk.
    pub fn is_drive(&self) -> bool {
        if self.property("DEVTYPE") != Some("disk") {
            return false;
        }
        self.properties.contains_key("ID_VENDOR")
            || self.properties.contains_key("ID_PATH")
            || is_virtio_disk(&self.name)
            || self.property("ID_MODEL").is_some_and(|m| m.contains("VMware"))
    }

    pub fn major_minor(&self) -> (u64, u64) {
        let parse = |k: &str| {
            self.property(k)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        (parse("MAJOR"), parse("MINOR"))
    }

    /// Stable ordering key for device lists.
    pub fn sort_index(&self) -> u64 {
        let (major, minor) = self.major_minor();
        major * 100_000 + minor
    }

    /// Human-readable name: vendor + model when udev knows them,
    /// falling back through serial/WWN identity to the kernel name.
    pub fn display_name(&self) -> String {
        let vendor = self.property("ID_VENDOR").map(decode_udev);
        let model  = self.property("ID_MODEL").map(decode_udev);
        match (vendor, model) {
            (Some(v), Some(m)) => format!("{} {}", v, m),
            (None, Some(m))    => m,
            (Some(v), None)    => v,
            (None, None) => self
                .property("ID_SERIAL")
                .or_else(|| self.property("ID_WWN"))
                .map(|s| s.to_string())
                .unwrap_or_else(|| self.name.clone()),
        }
    }
}

/// A block device that passed the drive predicate, with the fields the
/// snapshot carries. Class and size come from sysfs attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Drive {
    pub path:       PathBuf,
    pub name:       String,
    pub sort_index: u64,
    pub display:    String,
    pub class:      DriveClass,
    pub size:       u64,
}

impl Drive {
    pub fn from_device(dev: &BlockDevice) -> Drive {
        Drive {
            path:       dev.node.clone(),
            name:       dev.name.clone(),
            sort_index: dev.sort_index(),
            display:    dev.display_name(),
            class:      classify(&dev.syspath),
            size:       dev.size,
        }
    }
}

/// Removable media rank below everything else; otherwise rotational
/// tells spinning rust from solid state.
fn classify(syspath: &Path) -> DriveClass {
    if sysfs_flag(&syspath.join("removable")) {
        DriveClass::Drive
    } else if sysfs_flag(&syspath.join("queue/rotational")) {
        DriveClass::Hdd
    } else {
        DriveClass::Sdd
    }
}

fn sysfs_flag(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|s| s.trim() == "1")
        .unwrap_or(false)
}

fn is_virtio_disk(name: &str) -> bool {
    name.strip_prefix("vd")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_lowercase()))
}

/// udev encodes spaces in ID_* values as underscores.
fn decode_udev(value: &str) -> String {
    value.replace('_', " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(name: &str, props: &[(&str, &str)]) -> BlockDevice {
        BlockDevice {
            node:       PathBuf::from(format!("/dev/{}", name)),
            syspath:    PathBuf::from(format!("/sys/devices/virtual/block/{}", name)),
            name:       name.to_string(),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            size: 0,
        }
    }

    #[test]
    fn drive_predicate_requires_whole_disk() {
        let part = dev("sda1", &[("DEVTYPE", "partition"), ("ID_VENDOR", "ATA")]);
        assert!(!part.is_drive());

        let disk = dev("sda", &[("DEVTYPE", "disk"), ("ID_VENDOR", "ATA")]);
        assert!(disk.is_drive());
    }

    #[test]
    fn drive_predicate_accepts_virtio_and_vmware() {
        assert!(dev("vda", &[("DEVTYPE", "disk")]).is_drive());
        assert!(dev("vdab", &[("DEVTYPE", "disk")]).is_drive());
        assert!(!dev("vd1", &[("DEVTYPE", "disk")]).is_drive());

        let vmware = dev("sdb", &[("DEVTYPE", "disk"), ("ID_MODEL", "VMware_Virtual_disk")]);
        assert!(vmware.is_drive());

        let loopdev = dev("loop0", &[("DEVTYPE", "disk")]);
        assert!(!loopdev.is_drive());
    }

    #[test]
    fn drive_predicate_accepts_persistent_path_id() {
        let nvme = dev("nvme0n1", &[("DEVTYPE", "disk"), ("ID_PATH", "pci-0000:03:00.0-nvme-1")]);
        assert!(nvme.is_drive());
    }

    #[test]
    fn sort_index_is_major_scaled() {
        let d = dev("sdb", &[("MAJOR", "8"), ("MINOR", "16")]);
        assert_eq!(d.sort_index(), 800_016);
    }

    #[test]
    fn display_name_prefers_vendor_model() {
        let d = dev("sda", &[("ID_VENDOR", "ATA"), ("ID_MODEL", "Samsung_SSD_860")]);
        assert_eq!(d.display_name(), "ATA Samsung SSD 860");

        let bare = dev("vda", &[]);
        assert_eq!(bare.display_name(), "vda");

        let serial_only = dev("sdc", &[("ID_SERIAL", "WD-WCC4N5XYZ123")]);
        assert_eq!(serial_only.display_name(), "WD-WCC4N5XYZ123");
    }
}
