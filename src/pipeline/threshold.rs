//! Unit-count threshold that gates the AwaitingThreshold stage.

/// Decides whether enough units have been acquired for the day to advance.
///
/// Holds only the configured threshold; callers pass the current count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdMonitor {
    threshold: u32,
}

impl ThresholdMonitor {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Returns true if `units` reaches the threshold.
    pub fn is_met(&self, units: u32) -> bool {
        units >= self.threshold
    }

    /// Units still missing before the threshold is met.
    pub fn units_needed(&self, units: u32) -> u32 {
        self.threshold.saturating_sub(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundaries() {
        let monitor = ThresholdMonitor::new(8);
        assert!(!monitor.is_met(0));
        assert!(!monitor.is_met(7));
        assert!(monitor.is_met(8));
        assert!(monitor.is_met(12));
    }

    #[test]
    fn test_units_needed() {
        let monitor = ThresholdMonitor::new(8);
        assert_eq!(monitor.units_needed(0), 8);
        assert_eq!(monitor.units_needed(5), 3);
        assert_eq!(monitor.units_needed(8), 0);
        assert_eq!(monitor.units_needed(20), 0);
    }
}
