use crate::constants::{KEEP_ALIVE_SEND_EVERY_SECS, KEEP_ALIVE_STOP_AFTER_MINS};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// What the keep-alive timer sends on an idle connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeepAliveCommand {
    Noop,
    Pwd,
    Nlst,
    List,
}

impl KeepAliveCommand {
    pub fn needs_data_connection(self) -> bool {
        matches!(self, KeepAliveCommand::Nlst | KeepAliveCommand::List)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub send_every_secs: u64,
    pub stop_after_mins: u64,
    pub command: KeepAliveCommand,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            send_every_secs: KEEP_ALIVE_SEND_EVERY_SECS,
            stop_after_mins: KEEP_ALIVE_STOP_AFTER_MINS,
            command: KeepAliveCommand::Noop,
        }
    }
}

impl KeepAliveConfig {
    pub fn send_every(&self) -> Duration {
        Duration::from_secs(self.send_every_secs.max(1))
    }

    pub fn stop_after(&self) -> Duration {
        Duration::from_secs(self.stop_after_mins * 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveMode {
    /// Keep-alive is off or has expired.
    None,
    /// Idle, the timer may send a probe.
    Waiting,
    /// A probe is on the wire.
    Processing,
    /// A regular command is waiting for the probe to finish.
    WaitingForEndOfProcessing,
    /// A regular command is on the wire, probes are not allowed.
    Forbidden,
}

/// What a regular command has to do before it may touch the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAdmission {
    Proceed,
    WaitForProbe,
}

/// Keep-alive automaton of one control connection.
///
/// Pure bookkeeping: the control connection drives it under its own lock and
/// does the waiting and the I/O.
#[derive(Debug)]
pub struct KeepAliveState {
    mode: KeepAliveMode,
    enabled: bool,
    regular_commands: u32,
    /// Last regular command, measures how long the user has been idle.
    last_command: Instant,
    /// Last traffic of any kind, probes included.
    last_traffic: Instant,
}

impl KeepAliveState {
    pub fn new(enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            mode: KeepAliveMode::None,
            enabled,
            regular_commands: 0,
            last_command: now,
            last_traffic: now,
        }
    }

    pub fn mode(&self) -> KeepAliveMode {
        self.mode
    }

    /// Called once the session is logged in.
    pub fn start(&mut self) {
        let now = Instant::now();
        self.last_command = now;
        self.last_traffic = now;
        self.mode = if !self.enabled {
            KeepAliveMode::None
        } else if self.regular_commands > 0 {
            KeepAliveMode::Forbidden
        } else {
            KeepAliveMode::Waiting
        };
    }

    pub fn stop(&mut self) {
        self.mode = KeepAliveMode::None;
    }

    pub fn begin_command(&mut self) -> CommandAdmission {
        self.regular_commands += 1;
        let now = Instant::now();
        self.last_command = now;
        self.last_traffic = now;
        match self.mode {
            KeepAliveMode::Processing | KeepAliveMode::WaitingForEndOfProcessing => {
                self.mode = KeepAliveMode::WaitingForEndOfProcessing;
                CommandAdmission::WaitForProbe
            }
            KeepAliveMode::Waiting | KeepAliveMode::Forbidden => {
                self.mode = KeepAliveMode::Forbidden;
                CommandAdmission::Proceed
            }
            KeepAliveMode::None => CommandAdmission::Proceed,
        }
    }

    /// The probe finished or the wait for it timed out.
    pub fn force_forbidden(&mut self) {
        if self.mode != KeepAliveMode::None {
            self.mode = KeepAliveMode::Forbidden;
        }
    }

    /// Returns true when keep-alive had expired and the caller should restart it.
    pub fn end_command(&mut self) -> bool {
        self.regular_commands = self.regular_commands.saturating_sub(1);
        let now = Instant::now();
        self.last_command = now;
        self.last_traffic = now;
        if self.regular_commands == 0 && self.mode == KeepAliveMode::Forbidden {
            self.mode = KeepAliveMode::Waiting;
        }
        self.enabled && self.regular_commands == 0 && self.mode == KeepAliveMode::None
    }

    /// Moves to `Processing` when a probe may be sent now.
    pub fn begin_probe(&mut self) -> bool {
        if self.mode == KeepAliveMode::Waiting {
            self.mode = KeepAliveMode::Processing;
            true
        } else {
            false
        }
    }

    /// Returns whether a regular command was waiting for this probe.
    pub fn end_probe(&mut self) -> bool {
        self.last_traffic = Instant::now();
        match self.mode {
            KeepAliveMode::Processing => {
                self.mode = KeepAliveMode::Waiting;
                false
            }
            KeepAliveMode::WaitingForEndOfProcessing => {
                self.mode = KeepAliveMode::Forbidden;
                true
            }
            _ => false,
        }
    }

    /// When the next probe is due, or `None` once keep-alive has expired.
    pub fn next_probe_at(&self, config: &KeepAliveConfig) -> Option<Instant> {
        if self.mode == KeepAliveMode::None {
            return None;
        }
        if self.last_command.elapsed() >= config.stop_after() {
            return None;
        }
        Some(self.last_traffic + config.send_every())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_stays_none() {
        let mut state = KeepAliveState::new(false);
        state.start();
        assert_eq!(state.mode(), KeepAliveMode::None);
        assert_eq!(state.begin_command(), CommandAdmission::Proceed);
        assert!(!state.begin_probe());
        assert!(!state.end_command());
        assert_eq!(state.mode(), KeepAliveMode::None);
    }

    #[test]
    fn test_command_forbids_probes() {
        let mut state = KeepAliveState::new(true);
        state.start();
        assert_eq!(state.mode(), KeepAliveMode::Waiting);
        assert_eq!(state.begin_command(), CommandAdmission::Proceed);
        assert_eq!(state.mode(), KeepAliveMode::Forbidden);
        assert!(!state.begin_probe());
        state.end_command();
        assert_eq!(state.mode(), KeepAliveMode::Waiting);
    }

    #[test]
    fn test_command_waits_for_running_probe() {
        let mut state = KeepAliveState::new(true);
        state.start();
        assert!(state.begin_probe());
        assert_eq!(state.mode(), KeepAliveMode::Processing);
        assert_eq!(state.begin_command(), CommandAdmission::WaitForProbe);
        assert_eq!(state.mode(), KeepAliveMode::WaitingForEndOfProcessing);
        assert!(state.end_probe());
        assert_eq!(state.mode(), KeepAliveMode::Forbidden);
        state.end_command();
        assert_eq!(state.mode(), KeepAliveMode::Waiting);
    }

    #[test]
    fn test_probe_alone_returns_to_waiting() {
        let mut state = KeepAliveState::new(true);
        state.start();
        assert!(state.begin_probe());
        assert!(!state.end_probe());
        assert_eq!(state.mode(), KeepAliveMode::Waiting);
    }

    #[test]
    fn test_nested_commands_keep_forbidden() {
        let mut state = KeepAliveState::new(true);
        state.start();
        state.begin_command();
        state.begin_command();
        state.end_command();
        assert_eq!(state.mode(), KeepAliveMode::Forbidden);
        state.end_command();
        assert_eq!(state.mode(), KeepAliveMode::Waiting);
    }

    #[test]
    fn test_expiry() {
        let config = KeepAliveConfig {
            enabled: true,
            send_every_secs: 60,
            stop_after_mins: 0,
            command: KeepAliveCommand::Noop,
        };
        let mut state = KeepAliveState::new(true);
        state.start();
        assert!(state.next_probe_at(&config).is_none());

        let config = KeepAliveConfig { stop_after_mins: 30, ..config };
        assert!(state.next_probe_at(&config).is_some());
        state.stop();
        assert!(state.next_probe_at(&config).is_none());
    }

    #[test]
    fn test_expired_keep_alive_asks_for_restart() {
        let mut state = KeepAliveState::new(true);
        state.start();
        state.stop();
        state.begin_command();
        state.begin_command();
        assert!(!state.end_command());
        assert!(state.end_command());

        state.start();
        assert_eq!(state.mode(), KeepAliveMode::Waiting);
        state.begin_command();
        assert!(!state.end_command());
    }
}
