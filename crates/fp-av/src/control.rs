//! Live priority and signal control of a supervised process.
//!
//! A command owns one [`ProcessSlot`]. While a run is in flight the slot
//! holds the [`LiveProcess`] published by the supervisor; control requests
//! (signals, aborts, priority changes) travel over a channel into the
//! supervision loop, which is the only place the child handle lives.

use std::str::FromStr;

use fp_core::config::{MAX_NICENESS, MIN_NICENESS};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::tools::{Tool, ToolLocator};

/// Signals that can be sent to a running transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KillSignal {
    #[default]
    Kill,
    Term,
    Int,
    Hup,
    Quit,
    Stop,
    Cont,
    Usr1,
    Usr2,
}

impl KillSignal {
    /// Conventional signal name, e.g. `SIGKILL`.
    pub fn name(self) -> &'static str {
        match self {
            KillSignal::Kill => "SIGKILL",
            KillSignal::Term => "SIGTERM",
            KillSignal::Int => "SIGINT",
            KillSignal::Hup => "SIGHUP",
            KillSignal::Quit => "SIGQUIT",
            KillSignal::Stop => "SIGSTOP",
            KillSignal::Cont => "SIGCONT",
            KillSignal::Usr1 => "SIGUSR1",
            KillSignal::Usr2 => "SIGUSR2",
        }
    }
}

impl std::fmt::Display for KillSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KillSignal {
    type Err = fp_core::Error;

    /// Accepts `SIGKILL`, `KILL` or `kill` style names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        let signal = match bare {
            "KILL" => KillSignal::Kill,
            "TERM" => KillSignal::Term,
            "INT" => KillSignal::Int,
            "HUP" => KillSignal::Hup,
            "QUIT" => KillSignal::Quit,
            "STOP" => KillSignal::Stop,
            "CONT" => KillSignal::Cont,
            "USR1" => KillSignal::Usr1,
            "USR2" => KillSignal::Usr2,
            _ => return Err(fp_core::Error::config(format!("unknown signal '{s}'"))),
        };
        Ok(signal)
    }
}

#[cfg(unix)]
impl From<KillSignal> for nix::sys::signal::Signal {
    fn from(signal: KillSignal) -> Self {
        use nix::sys::signal::Signal;
        match signal {
            KillSignal::Kill => Signal::SIGKILL,
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Int => Signal::SIGINT,
            KillSignal::Hup => Signal::SIGHUP,
            KillSignal::Quit => Signal::SIGQUIT,
            KillSignal::Stop => Signal::SIGSTOP,
            KillSignal::Cont => Signal::SIGCONT,
            KillSignal::Usr1 => Signal::SIGUSR1,
            KillSignal::Usr2 => Signal::SIGUSR2,
        }
    }
}

/// Name of a raw signal number as reported by a terminated process.
#[cfg(unix)]
pub(crate) fn signal_name(raw: i32) -> String {
    nix::sys::signal::Signal::try_from(raw)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {raw}"))
}

/// Clamp a niceness value into the supported range, warning when it was out
/// of range.
pub fn clamp_niceness(value: i32) -> i32 {
    let clamped = value.clamp(MIN_NICENESS, MAX_NICENESS);
    if clamped != value {
        tracing::warn!(
            "Niceness {value} is outside {MIN_NICENESS}..={MAX_NICENESS}; using {clamped}"
        );
    }
    clamped
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

/// A request delivered to the supervision loop.
#[derive(Debug)]
pub(crate) enum ControlRequest {
    /// Send a signal to the process.
    Signal(KillSignal),
    /// Record `error` as the run's outcome (first one wins) and signal.
    Abort {
        error: fp_core::Error,
        signal: KillSignal,
    },
    /// Change the scheduling priority of the process.
    Renice(i32),
}

/// Cloneable sender for control requests to one running process.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlRequest>) -> Self {
        Self { tx }
    }

    /// Ask the supervisor to send `signal`. Returns `false` if the run has
    /// already completed.
    pub fn signal(&self, signal: KillSignal) -> bool {
        self.tx.send(ControlRequest::Signal(signal)).is_ok()
    }

    /// Fail the run with `error` and kill the process.
    pub fn abort(&self, error: fp_core::Error) -> bool {
        self.tx
            .send(ControlRequest::Abort {
                error,
                signal: KillSignal::Kill,
            })
            .is_ok()
    }

    pub(crate) fn renice(&self, niceness: i32) -> bool {
        self.tx.send(ControlRequest::Renice(niceness)).is_ok()
    }
}

// ---------------------------------------------------------------------------
// ProcessSlot
// ---------------------------------------------------------------------------

/// The process published by a running supervisor.
#[derive(Debug, Clone)]
pub struct LiveProcess {
    pub pid: Option<u32>,
    pub control: ControlHandle,
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Idle,
    /// A run owns the slot but no process is live (preparing or finalizing).
    Reserved,
    Live(LiveProcess),
}

/// Holds at most one live process per command.
#[derive(Debug, Default)]
pub struct ProcessSlot {
    state: Mutex<SlotState>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a run. Returns `None` if another run holds it.
    pub fn reserve(&self) -> Option<SlotReservation<'_>> {
        let mut state = self.state.lock();
        match *state {
            SlotState::Idle => {
                *state = SlotState::Reserved;
                Some(SlotReservation { slot: self })
            }
            _ => None,
        }
    }

    /// The currently live process, if any.
    pub fn live(&self) -> Option<LiveProcess> {
        match &*self.state.lock() {
            SlotState::Live(process) => Some(process.clone()),
            _ => None,
        }
    }

    /// Whether a run currently holds the slot.
    pub fn is_busy(&self) -> bool {
        !matches!(*self.state.lock(), SlotState::Idle)
    }

    pub(crate) fn publish(&self, process: LiveProcess) {
        *self.state.lock() = SlotState::Live(process);
    }

    /// Drop the live process while keeping the reservation.
    pub(crate) fn retire(&self) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Live(_)) {
            *state = SlotState::Reserved;
        }
    }

    fn release(&self) {
        *self.state.lock() = SlotState::Idle;
    }
}

/// Releases the slot when the owning run ends, however it ends.
#[derive(Debug)]
pub struct SlotReservation<'a> {
    slot: &'a ProcessSlot,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

// ---------------------------------------------------------------------------
// renice
// ---------------------------------------------------------------------------

/// Best-effort priority change of a running process. Failures are logged.
pub(crate) fn spawn_renice(locator: &ToolLocator, pid: Option<u32>, niceness: i32) {
    let Some(pid) = pid else {
        tracing::warn!("Cannot renice: process id is unavailable");
        return;
    };
    let renice = match locator.resolve(Tool::Renice) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!("Cannot renice process {pid}: {e}");
            return;
        }
    };

    tokio::spawn(async move {
        let result = tokio::process::Command::new(&renice)
            .args(["-n", &niceness.to_string(), "-p", &pid.to_string()])
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                tracing::debug!("Changed priority of process {pid} to {niceness}");
            }
            Ok(output) => tracing::warn!(
                "renice of process {pid} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => tracing::warn!("Failed to run renice for process {pid}: {e}"),
        }
    });
}
