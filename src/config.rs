use std::time::Duration;

/// Pipeline tunables
#[derive(Debug, Clone)]
pub struct SenseConfig {
    /// Longest a single backend read may block before the loop re-checks for
    /// close, pause and flush requests
    pub capture_poll: Duration,

    /// Delay between reopen attempts after a tolerated device loss
    pub reconnect_interval: Duration,

    /// Reopen attempts before the loss becomes fatal
    pub max_reconnect_attempts: u32,
}

impl Default for SenseConfig {
    fn default() -> Self {
        Self {
            capture_poll: Duration::from_millis(50),
            reconnect_interval: Duration::from_millis(500),
            max_reconnect_attempts: 10,
        }
    }
}
