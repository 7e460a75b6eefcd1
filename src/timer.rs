use std::time::Duration;

use rand::Rng;

use crate::config::RaftConfig;

/// Draws a random election timeout uniformly from `[base, base + jitter]`.
pub fn random_election_timeout(config: &RaftConfig) -> Duration {
    let base = config.election_timeout_base_ms;
    let jitter = config.election_timeout_jitter_ms;
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(base..=base + jitter))
}

/// The fixed interval between leader replication rounds.
pub fn heartbeat_interval(config: &RaftConfig) -> Duration {
    Duration::from_millis(config.heartbeat_interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_timeout_within_bounds() {
        let config = RaftConfig::default().with_election_timeout(100, 50);
        for _ in 0..100 {
            let timeout = random_election_timeout(&config);
            assert!(timeout >= Duration::from_millis(100));
            assert!(timeout <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_heartbeat_interval_is_fixed() {
        let config = RaftConfig::default().with_heartbeat_interval(20);
        assert_eq!(heartbeat_interval(&config), Duration::from_millis(20));
    }
}
