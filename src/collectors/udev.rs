use crate::models::device::BlockDevice;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Enumerate all block devices from the udev database.
pub fn list_block_devices() -> Result<Vec<BlockDevice>> {
    let out = Command::new("udevadm")
        .args(["info", "--export-db"])
        .output()
        .context("udevadm not found")?;
    if !out.status.success() {
        bail!("udevadm info --export-db failed: {}", out.status);
    }
    let text = String::from_utf8_lossy(&out.stdout);
    Ok(parse_export_db(&text, Path::new("/sys")))
}

/// Parse `udevadm info --export-db` output. Records are blank-line
/// separated; only SUBSYSTEM=block records become devices.
pub fn parse_export_db(text: &str, sysfs: &Path) -> Vec<BlockDevice> {
    text.split("\n\n")
        .filter_map(|record| parse_record(record, sysfs))
        .collect()
}

fn parse_record(record: &str, sysfs: &Path) -> Option<BlockDevice> {
    let mut syspath: Option<PathBuf> = None;
    let mut name: Option<String> = None;
    let mut properties = HashMap::new();

    for line in record.lines() {
        if let Some(p) = line.strip_prefix("P: ") {
            syspath = Some(sysfs.join(p.trim().trim_start_matches('/')));
        } else if let Some(n) = line.strip_prefix("N: ") {
            name = Some(n.trim().to_string());
        } else if let Some(e) = line.strip_prefix("E: ") {
            if let Some((key, value)) = e.split_once('=') {
                properties.insert(key.to_string(), value.to_string());
            }
        }
    }

    if properties.get("SUBSYSTEM").map(|s| s.as_str()) != Some("block") {
        return None;
    }
    let syspath = syspath?;
    let name = name?;
    let size = read_size(&syspath);

    Some(BlockDevice {
        node: PathBuf::from("/dev").join(&name),
        syspath,
        name,
        properties,
        size,
    })
}

/// Device size from the sysfs `size` attribute (512-byte sectors).
fn read_size(syspath: &Path) -> u64 {
    fs::read_to_string(syspath.join("size"))
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|sectors| sectors * 512)
        .unwrap_or(0)
}
