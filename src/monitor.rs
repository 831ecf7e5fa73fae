use crate::models::snapshot::PoolSnapshot;
use crate::{pool, SETUP_TOOL};
use anyhow::{Context, Result};
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Fallback poll interval when no device event arrives.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the last emitted snapshot and decides whether a freshly derived
/// one is worth emitting. Identical state is discarded silently.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    last: Option<PoolSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Adopt `snapshot` as the new baseline and return it for emission,
    /// unless it equals the current baseline structurally.
    pub fn observe(&mut self, snapshot: PoolSnapshot) -> Option<&PoolSnapshot> {
        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last = Some(snapshot);
        self.last.as_ref()
    }
}

/// Whether the setup tool on this system can manage the pool: the tool
/// must exist and its help must advertise the pool-reset option. An
/// absent tool is the unsupported case, not an error.
pub fn probe_can_manage() -> Result<bool> {
    probe_tool(SETUP_TOOL)
}

pub fn probe_tool(tool: &str) -> Result<bool> {
    match Command::new(tool).arg("--help").output() {
        Ok(out) => {
            // older tools print their usage to stderr
            let mut help = String::from_utf8_lossy(&out.stdout).into_owned();
            help.push_str(&String::from_utf8_lossy(&out.stderr));
            Ok(help.contains("--reset"))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to run {} --help", tool)),
    }
}

/// Run the monitoring loop until the udev event stream goes away.
///
/// Emits one JSON line per state change on stdout. Snapshot derivation
/// failures skip the cycle and keep the previous baseline; nothing is
/// reported for them.
pub fn run() -> Result<()> {
    let can_manage = probe_can_manage()?;
    log(&format!(
        "monitor starting (pool management {})",
        if can_manage { "supported" } else { "unsupported" }
    ));

    let mut tracker = ChangeTracker::new();
    if let Ok(snapshot) = pool::collect(can_manage) {
        if let Some(s) = tracker.observe(snapshot) {
            emit(s)?;
        }
    }

    let mut child = spawn_event_monitor()?;
    let events = line_channel(child.stdout.take().context("event monitor has no stdout")?);

    loop {
        let _block_event = match events.recv_timeout(POLL_TIMEOUT) {
            // Hint that a block device changed. Every cycle recomputes
            // the full state regardless, so this is informational only.
            Ok(line) => line.contains("(block)"),
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match pool::collect(can_manage) {
            Ok(snapshot) => {
                if let Some(s) = tracker.observe(snapshot) {
                    emit(s)?;
                }
            }
            // skip this cycle, keep the baseline; stdout stays silent
            Err(e) => log(&format!("skipping cycle: {:#}", e)),
        }
    }

    log("event monitor exited, stopping");
    let _ = child.wait();
    Ok(())
}

/// Long-lived udev monitor, line-buffered so events arrive promptly.
fn spawn_event_monitor() -> Result<Child> {
    Command::new("stdbuf")
        .args(["-oL", "udevadm", "monitor", "-u", "-s", "block"])
        .stdout(Stdio::piped())
        .spawn()
        .context("failed to start udevadm monitor")
}

/// Drain the event stream on its own thread; the loop multiplexes the
/// resulting channel with a timeout. The channel disconnecting means
/// the event process exited.
fn line_channel(stdout: ChildStdout) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn emit(snapshot: &PoolSnapshot) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, snapshot)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

fn log(msg: &str) {
    eprintln!("{} poolmon: {}", chrono::Local::now().format("%H:%M:%S"), msg);
}
