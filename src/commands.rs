use crate::sysconfig::Sysconfig;
use crate::{SETUP_TOOL, STORAGE_SERVICE};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;

/// Seam for the external commands the mutating flows issue, so the
/// step sequencing is testable without a root shell.
pub trait Runner {
    fn run(&mut self, program: &str, args: &[&str]) -> Result<()>;
    fn output(&mut self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs commands for real, echoing each one to stderr.
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&mut self, program: &str, args: &[&str]) -> Result<()> {
        eprintln!(
            "{} poolmon: running {} {}",
            chrono::Local::now().format("%H:%M:%S"),
            program,
            args.join(" ")
        );
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("{} not found", program))?;
        if !status.success() {
            bail!("{} {} failed: {}", program, args.join(" "), status);
        }
        Ok(())
    }

    fn output(&mut self, program: &str, args: &[&str]) -> Result<String> {
        let out = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("{} not found", program))?;
        if !out.status.success() {
            bail!("{} {} failed: {}", program, args.join(" "), out.status);
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Argument object of the `add` subcommand.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddRequest {
    pub driver: Option<String>,
    pub vgroup: Option<String>,
    #[serde(default)]
    pub devs:   Vec<String>,
    #[serde(default)]
    pub reset:  bool,
}

/// Stop the storage service, reset the pool, drop every unused PV from
/// the configured volume group and wipe it. The service restart at the
/// end runs no matter how far the sequence got.
pub fn reset_and_reduce(r: &mut dyn Runner, config_path: &Path) -> Result<()> {
    let result = reset_and_reduce_steps(r, config_path);
    let restart = r.run("systemctl", &["start", STORAGE_SERVICE]);
    result.and(restart)
}

fn reset_and_reduce_steps(r: &mut dyn Runner, config_path: &Path) -> Result<()> {
    r.run("systemctl", &["stop", STORAGE_SERVICE])?;
    r.run(SETUP_TOOL, &["--reset"])?;

    let mut config = Sysconfig::load(config_path)?;
    // Without a configured VG there is nothing safe to shrink.
    let Some(vg) = config.get("VG").map(|s| s.to_string()) else {
        return Ok(());
    };

    let report = r.output("pvs", &[
        "--noheadings", "--nosuffix", "--separator", "|",
        "-o", "pv_name,vg_name,pv_pe_alloc_count",
    ])?;
    let unused = parse_unused_pvs(&report, &vg);

    for pv in &unused {
        r.run("vgreduce", &[&vg, pv])?;
        r.run("wipefs", &["-a", pv])?;
    }
    if !unused.is_empty() {
        config.remove_devs(&unused);
        config.save(config_path)?;
    }
    Ok(())
}

/// PVs in `vg` with no allocated extents, from a pvs report.
pub fn parse_unused_pvs(report: &str, vg: &str) -> Vec<String> {
    report
        .lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.trim().split('|').collect();
            if f.len() < 3 || f[1] != vg {
                return None;
            }
            match f[2].parse::<u64>() {
                Ok(0) => Some(f[0].to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Wipe the requested devices and hand them to the setup tool,
/// optionally resetting the pool first. The service restart at the end
/// runs no matter how far the sequence got.
pub fn add(r: &mut dyn Runner, config_path: &Path, req: &AddRequest) -> Result<()> {
    let result = add_steps(r, config_path, req);
    let restart = r.run("systemctl", &["start", STORAGE_SERVICE]);
    result.and(restart)
}

fn add_steps(r: &mut dyn Runner, config_path: &Path, req: &AddRequest) -> Result<()> {
    for dev in &req.devs {
        r.run("wipefs", &["-a", dev])?;
    }
    r.run("systemctl", &["stop", STORAGE_SERVICE])?;
    if req.reset {
        r.run(SETUP_TOOL, &["--reset"])?;
    }

    let mut config = Sysconfig::load(config_path)?;
    if let Some(driver) = &req.driver {
        config.set("STORAGE_DRIVER", driver);
    }
    if let Some(vgroup) = &req.vgroup {
        config.set("VG", vgroup);
    }
    config.add_devs(&req.devs);
    config.save(config_path)?;

    r.run(SETUP_TOOL, &[])
}
