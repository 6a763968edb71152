//! Desktop metadata probes used by the process sampler.
//!
//! Which processes own a visible top-level window, and what friendly
//! description an executable carries, are platform questions. The sampler
//! only sees this trait; a failed probe means "no information".

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL_MS: u64 = 10;

pub trait DesktopProbe {
    /// Pids that currently own at least one top-level window.
    fn visible_window_pids(&self) -> Result<HashSet<u32>, String>;

    /// Friendly product/file description for an executable, if the platform
    /// records one.
    fn description(&self, _exe: &Path) -> Option<String> {
        None
    }
}

/// Lists managed X11 windows through `wmctrl -lp`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub struct WmctrlProbe {
    timeout: Duration,
}

impl WmctrlProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DesktopProbe for WmctrlProbe {
    fn visible_window_pids(&self) -> Result<HashSet<u32>, String> {
        let output = run_bounded("wmctrl", &["-lp"], self.timeout)?;
        Ok(parse_wmctrl_pids(&output))
    }
}

/// Probe for hosts without a supported window listing.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub struct UnsupportedProbe;

impl DesktopProbe for UnsupportedProbe {
    fn visible_window_pids(&self) -> Result<HashSet<u32>, String> {
        Err("Visible-window detection is not supported on this platform".to_string())
    }
}

#[cfg(target_os = "linux")]
pub fn platform_probe(timeout: Duration) -> Box<dyn DesktopProbe + Send> {
    Box::new(WmctrlProbe::new(timeout))
}

#[cfg(not(target_os = "linux"))]
pub fn platform_probe(_timeout: Duration) -> Box<dyn DesktopProbe + Send> {
    Box::new(UnsupportedProbe)
}

impl<P: DesktopProbe + ?Sized> DesktopProbe for Box<P> {
    fn visible_window_pids(&self) -> Result<HashSet<u32>, String> {
        (**self).visible_window_pids()
    }

    fn description(&self, exe: &Path) -> Option<String> {
        (**self).description(exe)
    }
}

// Format: `<window id> <desktop> <pid> <host> <title...>`; pid 0 means unknown.
fn parse_wmctrl_pids(output: &str) -> HashSet<u32> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .filter_map(|pid| pid.parse::<u32>().ok())
        .filter(|pid| *pid != 0)
        .collect()
}

/// Runs a command and returns its stdout, killing it if it outlives `timeout`.
fn run_bounded(program: &str, args: &[&str], timeout: Duration) -> Result<String, String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| format!("Failed to spawn {}: {}", program, err))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| format!("Failed to capture {} output", program))?;
    let reader = thread::spawn(move || {
        let mut buffer = String::new();
        stdout.read_to_string(&mut buffer).map(|_| buffer)
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!(
                    "{} timed out after {}ms",
                    program,
                    timeout.as_millis()
                ));
            }
            Ok(None) => thread::sleep(Duration::from_millis(POLL_INTERVAL_MS)),
            Err(err) => return Err(format!("Failed to wait for {}: {}", program, err)),
        }
    };

    let output = reader
        .join()
        .map_err(|_| format!("{} output reader panicked", program))?
        .map_err(|err| format!("Failed to read {} output: {}", program, err))?;

    if !status.success() {
        return Err(format!("{} exited with {}", program, status));
    }
    Ok(output)
}
