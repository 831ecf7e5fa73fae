use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;

/// One logical volume row from `lvs`.
#[derive(Debug, Clone)]
pub struct Lv {
    pub name:    String,
    pub vg:      String,
    pub size:    u64,
    /// Thin volumes name the pool LV they allocate from.
    pub pool_lv: Option<String>,
}

/// One physical volume row from `pvs`.
#[derive(Debug, Clone)]
pub struct Pv {
    pub name: String,
    pub vg:   String,
}

fn report(tool: &str, args: &[&str]) -> Result<String> {
    let out = Command::new(tool)
        .args(args)
        .output()
        .with_context(|| format!("{} not found", tool))?;
    if !out.status.success() {
        bail!("{} {} failed: {}", tool, args.join(" "), out.status);
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

pub fn read_lvs() -> Result<Vec<Lv>> {
    // pool_lv is empty for normal LVs, so keep an explicit separator.
    let text = report("lvs", &[
        "--noheadings", "--nosuffix", "--units", "b", "--separator", "|",
        "-o", "lv_name,vg_name,lv_size,pool_lv",
    ])?;
    Ok(parse_lvs(&text))
}

pub fn parse_lvs(text: &str) -> Vec<Lv> {
    text.lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.trim().split('|').collect();
            if f.len() < 4 || f[0].is_empty() {
                return None;
            }
            Some(Lv {
                name:    f[0].to_string(),
                vg:      f[1].to_string(),
                size:    f[2].parse().unwrap_or(0),
                pool_lv: if f[3].is_empty() { None } else { Some(f[3].to_string()) },
            })
        })
        .collect()
}

pub fn read_pvs() -> Result<Vec<Pv>> {
    let text = report("pvs", &[
        "--noheadings", "--nosuffix", "--units", "b", "--separator", "|",
        "-o", "pv_name,vg_name",
    ])?;
    Ok(parse_pvs(&text))
}

pub fn parse_pvs(text: &str) -> Vec<Pv> {
    text.lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.trim().split('|').collect();
            if f.len() < 2 || f[0].is_empty() {
                return None;
            }
            Some(Pv { name: f[0].to_string(), vg: f[1].to_string() })
        })
        .collect()
}

/// Free bytes left in a volume group.
pub fn vg_free(vg: &str) -> Result<u64> {
    let text = report("vgs", &[
        "--noheadings", "--nosuffix", "--units", "b", "-o", "vg_free", vg,
    ])?;
    text.trim()
        .parse()
        .map_err(|_| anyhow!("unparseable vg_free for {}: {:?}", vg, text.trim()))
}

/// Reverse-map a device node to the LV it is, if it is one.
pub fn lv_for_device(dev: &str) -> Result<Option<(String, String)>> {
    let out = Command::new("lvs")
        .args(["--noheadings", "-o", "lv_name,vg_name", dev])
        .output()
        .context("lvs not found")?;
    if !out.status.success() {
        return Ok(None); // not an LV
    }
    let text = String::from_utf8_lossy(&out.stdout);
    let f: Vec<&str> = text.split_whitespace().collect();
    if f.len() < 2 {
        return Ok(None);
    }
    Ok(Some((f[0].to_string(), f[1].to_string())))
}

/// The configured thin-pool autoextend threshold in percent. 100 means
/// the pool never grows into the VG's free space.
pub fn autoextend_threshold() -> u64 {
    let out = Command::new("lvm")
        .args(["lvmconfig", "activation/thin_pool_autoextend_threshold"])
        .output();
    match out {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            text.split('=')
                .nth(1)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(100)
        }
        _ => 100,
    }
}

/// Bytes allocated by a thin pool, from the device-mapper layer:
/// `dmsetup status` reports used data blocks, `dmsetup table` the data
/// block size in 512-byte sectors.
pub fn thin_pool_usage(vg: &str, lv: &str) -> Result<u64> {
    let dm = dm_name(vg, lv);
    let status = report("dmsetup", &["status", &dm])?;
    let table  = report("dmsetup", &["table", &dm])?;
    let used_blocks = parse_thin_status(&status)
        .ok_or_else(|| anyhow!("{} is not a thin-pool target", dm))?;
    let block_sectors = parse_thin_table(&table)
        .ok_or_else(|| anyhow!("no thin-pool table for {}", dm))?;
    Ok(used_blocks * block_sectors * 512)
}

/// Used data blocks from a thin-pool status line:
/// `0 <len> thin-pool <transid> <meta>/<meta_total> <data>/<data_total> ...`
pub fn parse_thin_status(line: &str) -> Option<u64> {
    let f: Vec<&str> = line.split_whitespace().collect();
    if f.get(2) != Some(&"thin-pool") {
        return None;
    }
    f.get(5)?.split('/').next()?.parse().ok()
}

/// Data block size (sectors) from a thin-pool table line:
/// `0 <len> thin-pool <meta_dev> <data_dev> <block_size> <low_water> ...`
pub fn parse_thin_table(line: &str) -> Option<u64> {
    let f: Vec<&str> = line.split_whitespace().collect();
    if f.get(2) != Some(&"thin-pool") {
        return None;
    }
    f.get(5)?.parse().ok()
}

/// Device-mapper name for vg/lv: dashes inside either name are doubled.
pub fn dm_name(vg: &str, lv: &str) -> String {
    format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"))
}

/// Split a /dev/mapper node name back into (vg, lv), undoing the
/// dash doubling. The separator is the only single dash.
pub fn split_dm_name(name: &str) -> Option<(String, String)> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'-' {
            if bytes.get(i + 1) == Some(&b'-') {
                i += 2;
                continue;
            }
            let vg = name[..i].replace("--", "-");
            let lv = name[i + 1..].replace("--", "-");
            if vg.is_empty() || lv.is_empty() {
                return None;
            }
            return Some((vg, lv));
        }
        i += 1;
    }
    None
}

/// Walk a block device down to the whole-disk node(s) backing it:
/// dm/md devices via their `slaves` directory, partitions via their
/// parent directory in sysfs.
pub fn physical_parents(name: &str, sysfs: &Path) -> Vec<String> {
    let mut out = Vec::new();
    walk_parents(name, sysfs, 0, &mut out);
    out
}

fn walk_parents(name: &str, sysfs: &Path, depth: u32, out: &mut Vec<String>) {
    if depth > 16 {
        return; // cyclical sysfs would be a kernel bug; stop anyway
    }
    let dir = sysfs.join("class/block").join(name);

    if let Ok(slaves) = fs::read_dir(dir.join("slaves")) {
        let names: Vec<String> = slaves
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        if !names.is_empty() {
            for slave in names {
                walk_parents(&slave, sysfs, depth + 1, out);
            }
            return;
        }
    }

    if dir.join("partition").exists() {
        if let Some(parent) = partition_parent(&dir) {
            walk_parents(&parent, sysfs, depth + 1, out);
            return;
        }
    }

    if !out.contains(&name.to_string()) {
        out.push(name.to_string());
    }
}

fn partition_parent(dir: &Path) -> Option<String> {
    let canonical = fs::canonicalize(dir).ok()?;
    canonical
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn parses_lvs_rows() {
        let text = "  pool00|docker-vg|42949672960|\n  docker-data|docker-vg|10737418240|pool00\n";
        let lvs = parse_lvs(text);
        assert_eq!(lvs.len(), 2);
        assert_eq!(lvs[0].name, "pool00");
        assert_eq!(lvs[0].size, 42949672960);
        assert_eq!(lvs[0].pool_lv, None);
        assert_eq!(lvs[1].pool_lv.as_deref(), Some("pool00"));
    }

    #[test]
    fn parses_pvs_rows() {
        let text = "  /dev/sda2|docker-vg\n  /dev/sdb|docker-vg\n";
        let pvs = parse_pvs(text);
        assert_eq!(pvs.len(), 2);
        assert_eq!(pvs[1].name, "/dev/sdb");
        assert_eq!(pvs[1].vg, "docker-vg");
    }

    #[test]
    fn thin_pool_status_and_table() {
        let status = "0 83886080 thin-pool 5 409/4096 1862/81920 - rw discard_passdown queue_if_no_space";
        assert_eq!(parse_thin_status(status), Some(1862));

        let table = "0 83886080 thin-pool 253:2 253:3 1024 0 1 skip_block_zeroing";
        assert_eq!(parse_thin_table(table), Some(1024));

        // 1862 blocks of 1024 sectors
        assert_eq!(1862 * 1024 * 512, 976_224_256);

        let linear = "0 2048 linear 8:1 0";
        assert_eq!(parse_thin_status(linear), None);
        assert_eq!(parse_thin_table(linear), None);
    }

    #[test]
    fn dm_name_round_trips_dashes() {
        assert_eq!(dm_name("docker-vg", "pool00"), "docker--vg-pool00");
        assert_eq!(
            split_dm_name("docker--vg-pool00"),
            Some(("docker-vg".into(), "pool00".into()))
        );
        assert_eq!(
            split_dm_name("vg0-my--thin--pool"),
            Some(("vg0".into(), "my-thin-pool".into()))
        );
        assert_eq!(split_dm_name("nodash"), None);
    }

    #[test]
    fn parent_walk_resolves_partitions_and_slaves() {
        let tmp = tempfile::tempdir().unwrap();
        let sysfs = tmp.path();

        // sda with partition sda1; dm-0 stacked on sda1 via slaves/
        let sda  = sysfs.join("devices/pci0/host0/block/sda");
        let sda1 = sda.join("sda1");
        fs::create_dir_all(&sda1).unwrap();
        fs::write(sda1.join("partition"), "1\n").unwrap();

        let class = sysfs.join("class/block");
        fs::create_dir_all(&class).unwrap();
        symlink(&sda, class.join("sda")).unwrap();
        symlink(&sda1, class.join("sda1")).unwrap();

        let dm0 = sysfs.join("devices/virtual/block/dm-0");
        fs::create_dir_all(dm0.join("slaves")).unwrap();
        fs::create_dir_all(dm0.join("slaves/sda1")).unwrap();
        symlink(&dm0, class.join("dm-0")).unwrap();

        assert_eq!(physical_parents("sda", sysfs), vec!["sda".to_string()]);
        assert_eq!(physical_parents("sda1", sysfs), vec!["sda".to_string()]);
        assert_eq!(physical_parents("dm-0", sysfs), vec!["sda".to_string()]);
    }
}
