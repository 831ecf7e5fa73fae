use anyhow::Result;
use std::fs;
use std::path::Path;

/// Layer databases summed for filesystem-backed drivers, with the
/// empirical correction factor for each layout's known undercounting.
const LAYER_DBS: &[(&str, f64)] = &[
    ("image/overlay2/layerdb", 1.2),
    ("image/overlay/layerdb", 1.1),
];

/// Bytes used by image layers, estimated from the per-layer `size`
/// files under the layer databases.
pub fn layer_db_usage(image_root: &Path) -> u64 {
    LAYER_DBS
        .iter()
        .map(|(subdir, factor)| (sum_layer_sizes(&image_root.join(subdir)) as f64 * factor) as u64)
        .sum()
}

fn sum_layer_sizes(layerdb: &Path) -> u64 {
    let entries = match fs::read_dir(layerdb.join("sha256")) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| fs::read_to_string(e.path().join("size")).ok())
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .sum()
}

/// Capacity figures for the filesystem holding the image store.
#[derive(Debug, Clone, Copy)]
pub struct FsStat {
    pub total: u64,
    pub free:  u64,
}

pub fn statvfs(path: &Path) -> Result<FsStat> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let frsize = stat.fragment_size() as u64;
    Ok(FsStat {
        total: stat.blocks() as u64 * frsize,
        free:  stat.blocks_free() as u64 * frsize,
    })
}

/// Total pool capacity for filesystem-backed drivers: free space plus
/// used, where capacity is the backing LV's adjusted size when one
/// exists, else the raw filesystem size. Saturates so total >= used.
pub fn filesystem_total(capacity: Option<u64>, fs: FsStat, used: u64) -> u64 {
    let fs_used = fs.total.saturating_sub(fs.free);
    let free = capacity.unwrap_or(fs.total).saturating_sub(fs_used);
    free + used
}
