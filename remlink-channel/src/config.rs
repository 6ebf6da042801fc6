//! Process-wide tunables.
//!
//! Read once at channel construction; later environment changes do not
//! affect live channels.

/// Default bound on the unexport audit log.
pub const DEFAULT_UNEXPORT_LOG_SIZE: usize = 1024;

/// Default per-pipe send window (128 KiB).
pub const DEFAULT_PIPE_WINDOW: usize = 128 * 1024;

/// Tunable knobs, defaulted and then overridden from the environment.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Bound on the unexport audit log used to diagnose stale OIDs.
    pub unexport_log_size: usize,
    /// Carry outbound call-site descriptions on requests for debugging.
    pub chain_cause: bool,
    /// Maximum unacknowledged bytes per remote pipe.
    pub pipe_window_size: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            unexport_log_size: DEFAULT_UNEXPORT_LOG_SIZE,
            chain_cause: false,
            pipe_window_size: DEFAULT_PIPE_WINDOW,
        }
    }
}

impl Tunables {
    /// Loads defaults, then applies environment variable overrides.
    pub fn from_env() -> Self {
        let mut t = Self::default();
        t.apply_env_overrides();
        t
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REMLINK_UNEXPORT_LOG_SIZE") {
            if let Ok(n) = v.parse() {
                self.unexport_log_size = n;
            }
        }

        if let Ok(v) = std::env::var("REMLINK_CHAIN_CAUSE") {
            self.chain_cause = matches!(v.as_str(), "1" | "true" | "yes");
        }

        if let Ok(v) = std::env::var("REMLINK_PIPE_WINDOW") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    self.pipe_window_size = n;
                }
            }
        }
    }
}
