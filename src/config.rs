/// Timing knobs for a Raft node.
///
/// The defaults suit a LAN cluster; tests run much tighter values. The
/// heartbeat interval should stay well below the election timeout base
/// (roughly an eighth) so a healthy leader never lets followers time out.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_base_ms: u64,
    /// Width of the uniform jitter added on top of the base, in milliseconds.
    pub election_timeout_jitter_ms: u64,
    /// Interval between leader replication rounds, in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_base_ms: 400,
            election_timeout_jitter_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl RaftConfig {
    pub fn with_election_timeout(mut self, base_ms: u64, jitter_ms: u64) -> Self {
        self.election_timeout_base_ms = base_ms;
        self.election_timeout_jitter_ms = jitter_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }
}
