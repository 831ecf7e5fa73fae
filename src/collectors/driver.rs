use crate::STORAGE_CONFIG;
use anyhow::Result;
use std::fs;
use std::path::Path;

pub const DEFAULT_DRIVER: &str = "overlay2";

/// The engine's active storage driver, from its sysconfig command line.
/// Absent file or option means the compiled-in default.
pub fn storage_driver() -> String {
    fs::read_to_string(STORAGE_CONFIG)
        .ok()
        .and_then(|text| driver_from(&text))
        .unwrap_or_else(|| DEFAULT_DRIVER.to_string())
}

/// Extract `--storage-driver <name>` (or `--storage-driver=<name>`)
/// from sysconfig option lines.
pub fn driver_from(text: &str) -> Option<String> {
    scan_option(text, "--storage-driver")
}

/// The thin-pool device configured via `--storage-opt dm.thinpooldev=...`.
pub fn thinpooldev_from(text: &str) -> Option<String> {
    let mut tokens = tokens(text);
    while let Some(tok) = tokens.next() {
        let opt = if tok == "--storage-opt" {
            tokens.next()?
        } else if let Some(rest) = tok.strip_prefix("--storage-opt=") {
            rest
        } else {
            continue;
        };
        if let Some(dev) = opt.strip_prefix("dm.thinpooldev=") {
            return Some(dev.to_string());
        }
    }
    None
}

fn scan_option(text: &str, option: &str) -> Option<String> {
    let eq_form = format!("{}=", option);
    let mut tokens = tokens(text);
    while let Some(tok) = tokens.next() {
        if tok == option {
            return tokens.next().map(|v| v.to_string());
        }
        if let Some(value) = tok.strip_prefix(&eq_form) {
            return Some(value.to_string());
        }
    }
    None
}

/// Whitespace tokens of each assignment's value, shell quoting stripped.
fn tokens(text: &str) -> impl Iterator<Item = &str> + '_ {
    text.lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .map(|l| match l.split_once('=') {
            Some((key, value)) if is_ident(key.trim()) => value,
            _ => l,
        })
        .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\''))
        .flat_map(|v| v.split_whitespace())
}

fn is_ident(key: &str) -> bool {
    let mut chars = key.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The device mounted closest above `path`, from mount-table text in
/// /proc/mounts format.
pub fn mount_device_for(path: &Path, mounts: &str) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    for line in mounts.lines() {
        let f: Vec<&str> = line.split_whitespace().collect();
        if f.len() < 2 {
            continue;
        }
        let (device, mount) = (decode_mount_path(f[0]), decode_mount_path(f[1]));
        if !device.starts_with("/dev/") {
            continue;
        }
        if path.starts_with(&mount) {
            let len = mount.len();
            if best.as_ref().map_or(true, |(l, _)| len > *l) {
                best = Some((len, device));
            }
        }
    }
    best.map(|(_, d)| d)
}

/// The kernel octal-escapes whitespace in mount-table fields
/// (`\040` for space, `\011` for tab, `\134` for backslash).
fn decode_mount_path(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let code = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(char::from_u32(code).unwrap_or('\\'));
            i += 4;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

/// The device backing the image store: the mount covering it, falling
/// back to the root filesystem.
pub fn image_store_device(image_root: &Path) -> Result<Option<String>> {
    let mounts = fs::read_to_string("/proc/mounts")?;
    Ok(mount_device_for(image_root, &mounts)
        .or_else(|| mount_device_for(Path::new("/"), &mounts)))
}
