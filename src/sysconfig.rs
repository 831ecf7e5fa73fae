use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Editor for shell-style `KEY="value"` sysconfig files.
///
/// Round-trip guarantee: parse → mutate one key → serialize reproduces
/// every untouched line byte-for-byte. Comments, blank lines, and lines
/// that are not simple assignments pass through verbatim.
#[derive(Debug, Clone, Default)]
pub struct Sysconfig {
    lines: Vec<Line>,
    trailing_newline: bool,
}

#[derive(Debug, Clone)]
enum Line {
    /// A `KEY=value` assignment. `raw` is the exact original text and is
    /// only regenerated when the key is mutated.
    Assign { key: String, value: String, raw: String },
    Other(String),
}

impl Sysconfig {
    pub fn parse(text: &str) -> Sysconfig {
        let lines = text.lines().map(parse_line).collect();
        Sysconfig {
            lines,
            trailing_newline: text.is_empty() || text.ends_with('\n'),
        }
    }

    /// Load from disk; a missing file is an empty config.
    pub fn load(path: &Path) -> Result<Sysconfig> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Sysconfig::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sysconfig::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())
            .with_context(|| format!("cannot write {}", path.display()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Assign { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Rewrite the assignment in place, or append `KEY="value"` if the
    /// key never appears. With duplicate keys the last assignment is
    /// the one the shell honours, so that is the one rewritten.
    pub fn set(&mut self, key: &str, value: &str) {
        let raw = format!("{}=\"{}\"", key, value);
        for line in self.lines.iter_mut().rev() {
            if let Line::Assign { key: k, value: v, raw: r } = line {
                if k == key {
                    *v = value.to_string();
                    *r = raw;
                    return;
                }
            }
        }
        self.lines.push(Line::Assign {
            key: key.to_string(),
            value: value.to_string(),
            raw,
        });
        self.trailing_newline = true;
    }

    /// Add device paths to the whitespace-delimited `DEVS` list,
    /// skipping ones already present.
    pub fn add_devs(&mut self, devs: &[String]) {
        let mut list = self.devs();
        for dev in devs {
            if !list.iter().any(|d| d == dev) {
                list.push(dev.clone());
            }
        }
        self.set("DEVS", &list.join(" "));
    }

    /// Remove device paths from `DEVS`, keeping the survivors' order.
    pub fn remove_devs(&mut self, devs: &[String]) {
        let list: Vec<String> = self
            .devs()
            .into_iter()
            .filter(|d| !devs.iter().any(|r| r == d))
            .collect();
        self.set("DEVS", &list.join(" "));
    }

    pub fn devs(&self) -> Vec<String> {
        self.get("DEVS")
            .unwrap_or("")
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }
}

impl std::fmt::Display for Sysconfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match line {
                Line::Assign { raw, .. } => write!(f, "{}", raw)?,
                Line::Other(text) => write!(f, "{}", text)?,
            }
        }
        if self.trailing_newline && !self.lines.is_empty() {
            writeln!(f)?;
        }
        Ok(())
    }
}

fn parse_line(line: &str) -> Line {
    let Some((key, value)) = line.split_once('=') else {
        return Line::Other(line.to_string());
    };
    if key.is_empty()
        || !key.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Line::Other(line.to_string());
    }
    Line::Assign {
        key: key.to_string(),
        value: unquote(value).to_string(),
        raw: line.to_string(),
    }
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Managed by docker-storage-setup
STORAGE_DRIVER=devicemapper

VG=\"docker-vg\"
DEVS=\"/dev/sdb /dev/sdc\"
# trailing comment
";

    #[test]
    fn untouched_lines_round_trip_byte_for_byte() {
        let cfg = Sysconfig::parse(SAMPLE);
        assert_eq!(cfg.to_string(), SAMPLE);

        let mut cfg = Sysconfig::parse(SAMPLE);
        cfg.set("VG", "other-vg");
        let expected = SAMPLE.replace("VG=\"docker-vg\"", "VG=\"other-vg\"");
        assert_eq!(cfg.to_string(), expected);
    }

    #[test]
    fn get_strips_quotes() {
        let cfg = Sysconfig::parse(SAMPLE);
        assert_eq!(cfg.get("STORAGE_DRIVER"), Some("devicemapper"));
        assert_eq!(cfg.get("VG"), Some("docker-vg"));
        assert_eq!(cfg.get("MISSING"), None);
    }

    #[test]
    fn set_appends_missing_key_with_quotes() {
        let mut cfg = Sysconfig::parse("A=1\n");
        cfg.set("WIPE_SIGNATURES", "true");
        assert_eq!(cfg.to_string(), "A=1\nWIPE_SIGNATURES=\"true\"\n");
    }

    #[test]
    fn set_rewrites_the_last_assignment_of_a_duplicate_key() {
        let text = "DEVS=\"/dev/sda\"\n# site override below\nDEVS=\"/dev/sdb\"\n";
        let mut cfg = Sysconfig::parse(text);
        cfg.add_devs(&["/dev/sdc".into()]);
        // the shell-effective (last) line carries the mutation
        assert_eq!(cfg.get("DEVS"), Some("/dev/sdb /dev/sdc"));
        assert_eq!(
            cfg.to_string(),
            "DEVS=\"/dev/sda\"\n# site override below\nDEVS=\"/dev/sdb /dev/sdc\"\n"
        );
    }

    #[test]
    fn devs_set_arithmetic() {
        let mut cfg = Sysconfig::parse(SAMPLE);
        cfg.add_devs(&["/dev/sdc".into(), "/dev/sdd".into()]);
        assert_eq!(cfg.get("DEVS"), Some("/dev/sdb /dev/sdc /dev/sdd"));

        cfg.remove_devs(&["/dev/sdb".into()]);
        assert_eq!(cfg.get("DEVS"), Some("/dev/sdc /dev/sdd"));
    }

    #[test]
    fn add_devs_creates_the_variable_when_absent() {
        let mut cfg = Sysconfig::parse("# empty\n");
        cfg.add_devs(&["/dev/sdb".into()]);
        assert_eq!(cfg.to_string(), "# empty\nDEVS=\"/dev/sdb\"\n");
    }

    #[test]
    fn odd_lines_pass_through() {
        let text = "if [ -f /etc/foo ]; then\n  . /etc/foo\nfi\n2BAD=x\n";
        let cfg = Sysconfig::parse(text);
        assert_eq!(cfg.to_string(), text);
        assert_eq!(cfg.get("2BAD"), None);
    }
}
