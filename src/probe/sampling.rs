//! Emission sampling for flow accounting updates.
//!
//! New flows are reported at cumulative packet counts 1, 2, 4, 8, 16 and 32
//! (the startup burst). Past the burst, a flow is reported on the first
//! packet seen once the cooldown has elapsed since its previous report.
//! Destroy events bypass the policy entirely.

use std::time::Duration;

/// Last packet count that can trigger a startup burst report.
pub const BURST_MAX_PACKETS: u64 = 32;

/// Packet-driven sampling policy with a minimum-interval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicy {
    cooldown: Duration,
}

impl SamplingPolicy {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Decides whether the packet that brought the flow to `packets_total`
    /// cumulative packets should produce an Update.
    ///
    /// `since_last_report` is the time elapsed since the flow's previous
    /// report, or `None` if the flow has never been reported.
    pub fn should_emit(&self, packets_total: u64, since_last_report: Option<Duration>) -> bool {
        if packets_total == 0 {
            return false;
        }

        if packets_total <= BURST_MAX_PACKETS {
            return packets_total.is_power_of_two();
        }

        match since_last_report {
            Some(elapsed) => elapsed >= self.cooldown,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CD: Duration = Duration::from_millis(20);

    #[test]
    fn test_burst_reports_powers_of_two() {
        let policy = SamplingPolicy::new(CD);

        // Time since last report is irrelevant inside the burst.
        let reported: Vec<u64> = (1..=BURST_MAX_PACKETS)
            .filter(|&n| policy.should_emit(n, Some(Duration::ZERO)))
            .collect();

        assert_eq!(reported, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_burst_ignores_elapsed_cooldown() {
        let policy = SamplingPolicy::new(CD);
        assert!(!policy.should_emit(3, Some(Duration::from_secs(60))));
        assert!(!policy.should_emit(31, Some(Duration::from_secs(60))));
    }

    #[test]
    fn test_steady_state_gated_by_cooldown() {
        let policy = SamplingPolicy::new(CD);

        assert!(!policy.should_emit(33, Some(Duration::from_millis(5))));
        assert!(!policy.should_emit(64, Some(CD - Duration::from_nanos(1))));
        assert!(policy.should_emit(33, Some(CD)));
        assert!(policy.should_emit(1000, Some(CD * 3)));
    }

    #[test]
    fn test_steady_state_never_reported_emits() {
        let policy = SamplingPolicy::new(CD);
        assert!(policy.should_emit(40, None));
    }

    #[test]
    fn test_zero_packets_never_emits() {
        let policy = SamplingPolicy::new(CD);
        assert!(!policy.should_emit(0, None));
    }
}
