use std::net::SocketAddr;
use std::time::Duration;

/// Default port of the control listener used for handover.
pub const DEFAULT_CONTROL_PORT: u16 = 30103;

/// Configuration for the handover control listener.
///
/// A scheduler that owns the default control address manages the fleet. A
/// freshly started scheduler that finds the address taken can ask the owner
/// to hand its devices over instead of fighting for them.
#[derive(Debug, Clone)]
pub struct HandoverConfig {
    /// Start the control listener when the scheduler starts.
    pub enabled: bool,

    /// Address the control listener binds (and a sibling is reached at).
    pub control_addr: SocketAddr,

    /// When the control address is taken, take over from its owner.
    /// When false, bind an ephemeral port and run independently.
    pub auto_handover: bool,

    /// Upper bound for every handshake step, in milliseconds.
    pub handshake_timeout_ms: u64,

    /// How many times to retry binding the control address after a
    /// completed handover.
    pub rebind_attempts: u32,

    /// Delay between rebind attempts, in milliseconds.
    pub rebind_delay_ms: u64,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            control_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_CONTROL_PORT)),
            auto_handover: false,
            handshake_timeout_ms: 2 * 60 * 1000,
            rebind_attempts: 10,
            rebind_delay_ms: 2000,
        }
    }
}

impl HandoverConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn rebind_delay(&self) -> Duration {
        Duration::from_millis(self.rebind_delay_ms)
    }
}

/// Scheduler-wide options, fixed at construction.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on how long the scheduling loop sleeps between passes.
    pub poll_interval_ms: u64,

    /// Window between a cooperative stop request and forced interruption of
    /// an invocation. Zero disables escalation for operator stops; timeouts
    /// and hard shutdown always escalate.
    pub stop_escalation_ms: u64,

    /// Watch loaded command files and reload them when they change.
    pub reload_command_files: bool,

    /// Interval between command file modification checks.
    pub command_file_poll_interval_ms: u64,

    /// Shut the scheduler down when a command file fails to load.
    pub shutdown_on_command_file_error: bool,

    pub handover: HandoverConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30 * 1000,
            stop_escalation_ms: 0,
            reload_command_files: false,
            command_file_poll_interval_ms: 20 * 1000,
            shutdown_on_command_file_error: false,
            handover: HandoverConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(poll_interval_ms: u64) -> Self {
        Self {
            poll_interval_ms,
            ..Default::default()
        }
    }

    pub fn with_command_file_reload(mut self, poll_interval_ms: u64) -> Self {
        self.reload_command_files = true;
        self.command_file_poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_stop_escalation(mut self, escalation_ms: u64) -> Self {
        self.stop_escalation_ms = escalation_ms;
        self
    }

    pub fn with_handover(mut self, handover: HandoverConfig) -> Self {
        self.handover = handover;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_file_poll_interval_ms)
    }

    /// Escalation window for operator-initiated stops, `None` when disabled.
    pub fn stop_escalation(&self) -> Option<Duration> {
        if self.stop_escalation_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.stop_escalation_ms))
        }
    }
}
