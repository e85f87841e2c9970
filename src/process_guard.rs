//! Process lifecycle for external tools
//!
//! External tools run in their own process group so a terminal Ctrl-C
//! reaches the planner but not a half-finished `parted` or `mkfs`. While a
//! commit batch runs, SIGINT/SIGTERM/SIGHUP are recorded instead of acted
//! on; the caller learns about them once the batch is over.
//!
//! # Design
//!
//! - Children get `setpgid(0, 0)` and `PR_SET_PDEATHSIG` in `pre_exec`
//! - A batch is never cancelled, it runs to completion or first failure
//! - [`SignalDeferral`] owns the signal-hook registration for one batch

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Configure the command to run in its own process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                // the tool dies with the planner instead of running on orphaned
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

/// Send a signal to an entire process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie)
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    // field 3 of /proc/<pid>/stat is the state
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }
    true
}

/// SIGTERM the process group led by `pgid`, SIGKILL it after `grace`.
pub fn terminate_group(pgid: u32, grace: Duration) {
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGTERM) {
        debug!(pgid, error = %e, "SIGTERM to process group failed");
        return;
    }
    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_process_alive(pgid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    warn!(pgid, "Process group did not terminate, sending SIGKILL");
    let _ = send_signal_to_group(pgid, Signal::SIGKILL);
}

/// Readable name of the signals a batch defers.
pub fn signal_name(sig: i32) -> &'static str {
    match sig {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        _ => "UNKNOWN",
    }
}

/// Records termination signals for the duration of one commit batch.
pub struct SignalDeferral {
    signals: Signals,
    received: Option<i32>,
}

impl SignalDeferral {
    /// Start catching SIGINT, SIGTERM and SIGHUP.
    pub fn install() -> std::io::Result<Self> {
        let signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
        Ok(Self {
            signals,
            received: None,
        })
    }

    /// Drain what arrived so far; the first signal is the one reported.
    pub fn poll(&mut self) -> Option<i32> {
        for sig in self.signals.pending() {
            warn!(signal = signal_name(sig), "Signal received during commit, deferred until the batch ends");
            self.received.get_or_insert(sig);
        }
        self.received
    }

    /// Stop catching and return the first signal received, if any.
    pub fn finish(mut self) -> Option<i32> {
        let received = self.poll();
        self.signals.handle().close();
        received
    }
}
