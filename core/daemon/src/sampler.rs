//! Process sampling and relevance classification.
//!
//! A sample lists every process the OS reports, each marked relevant or not.
//! Relevance rules, in order:
//! 1. the process must own a visible top-level window and have a readable
//!    executable path,
//! 2. its executable must not live under a protected system directory,
//! 3. it must not be the monitor's own companion UI (name or description,
//!    case-insensitive).
//!
//! The display name prefers the friendly description and falls back to the
//! process name. Metadata that cannot be read counts as absent; it never
//! fails the sample.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::debug;

use crate::desktop::DesktopProbe;

/// Maximum start-time drift (seconds) for two sightings of a pid to count as
/// the same process.
pub const START_TIME_TOLERANCE_SECS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessObservation {
    pub pid: u32,
    pub display_name: String,
    pub is_relevant: bool,
    /// Process start time (unix seconds), when the OS reports one.
    pub started_at: Option<u64>,
}

impl ProcessObservation {
    /// Whether this observation can be the same OS process as one first seen
    /// with `tracked_start`.
    pub fn same_process_as(&self, tracked_start: Option<u64>) -> bool {
        match (self.started_at, tracked_start) {
            (Some(current), Some(tracked)) => {
                current.abs_diff(tracked) <= START_TIME_TOLERANCE_SECS
            }
            _ => true,
        }
    }
}

pub trait ProcessSampler {
    fn sample(&mut self) -> Result<Vec<ProcessObservation>, String>;
}

#[derive(Debug, Clone)]
pub struct RelevancePolicy {
    pub require_visible_window: bool,
    pub self_names: Vec<String>,
    pub system_dirs: Vec<PathBuf>,
}

/// Raw per-process facts gathered before classification.
#[derive(Debug, Clone, Default)]
pub struct ProcessCandidate {
    pub pid: u32,
    pub name: String,
    pub exe: Option<PathBuf>,
    pub description: Option<String>,
    pub has_visible_window: bool,
    pub started_at: Option<u64>,
}

pub fn classify(candidate: &ProcessCandidate, policy: &RelevancePolicy) -> ProcessObservation {
    ProcessObservation {
        pid: candidate.pid,
        display_name: display_name(candidate),
        is_relevant: is_relevant(candidate, policy),
        started_at: candidate.started_at,
    }
}

fn is_relevant(candidate: &ProcessCandidate, policy: &RelevancePolicy) -> bool {
    if policy.require_visible_window && !candidate.has_visible_window {
        return false;
    }
    // No readable executable path: never a candidate.
    let Some(exe) = candidate.exe.as_deref() else {
        return false;
    };
    if is_under_system_dir(exe, &policy.system_dirs) {
        return false;
    }

    !is_self(candidate, &policy.self_names)
}

fn display_name(candidate: &ProcessCandidate) -> String {
    match candidate.description.as_deref() {
        Some(description) if !description.trim().is_empty() => description.to_string(),
        _ => candidate.name.clone(),
    }
}

fn is_under_system_dir(exe: &Path, system_dirs: &[PathBuf]) -> bool {
    let Some(folder) = exe.parent() else {
        return false;
    };
    let folder = lowercase_path(folder);
    system_dirs
        .iter()
        .any(|dir| !dir.as_os_str().is_empty() && folder.starts_with(lowercase_path(dir)))
}

fn lowercase_path(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

fn is_self(candidate: &ProcessCandidate, self_names: &[String]) -> bool {
    let name = candidate.name.to_lowercase();
    let short_name = strip_exe_suffix(&candidate.name).to_lowercase();
    let description = candidate.description.as_deref().map(str::to_lowercase);

    self_names.iter().map(|own| own.to_lowercase()).any(|own| {
        own == name || own == short_name || description.as_deref() == Some(own.as_str())
    })
}

fn strip_exe_suffix(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
        &name[..len - 4]
    } else {
        name
    }
}

/// Samples the live process table through `sysinfo`.
pub struct SystemSampler<P> {
    policy: RelevancePolicy,
    probe: P,
}

impl<P: DesktopProbe> SystemSampler<P> {
    pub fn new(policy: RelevancePolicy, probe: P) -> Self {
        Self { policy, probe }
    }

    fn window_pids(&self) -> HashSet<u32> {
        if !self.policy.require_visible_window {
            return HashSet::new();
        }
        match self.probe.visible_window_pids() {
            Ok(pids) => pids,
            Err(err) => {
                debug!(error = %err, "Visible-window probe failed; treating as no windows");
                HashSet::new()
            }
        }
    }
}

impl<P: DesktopProbe> ProcessSampler for SystemSampler<P> {
    fn sample(&mut self) -> Result<Vec<ProcessObservation>, String> {
        let windows = self.window_pids();

        let mut sys = System::new();
        sys.refresh_processes_specifics(ProcessRefreshKind::new().with_exe(UpdateKind::Always));

        let mut observations = Vec::with_capacity(sys.processes().len());
        for (pid, process) in sys.processes() {
            let pid = pid.as_u32();
            let exe = process.exe().map(Path::to_path_buf);
            let description = exe
                .as_deref()
                .and_then(|exe| self.probe.description(exe));
            let started_at = match process.start_time() {
                0 => None,
                value => Some(value),
            };

            let candidate = ProcessCandidate {
                pid,
                name: process.name().to_string(),
                exe,
                description,
                has_visible_window: windows.contains(&pid),
                started_at,
            };
            observations.push(classify(&candidate, &self.policy));
        }

        Ok(observations)
    }
}
