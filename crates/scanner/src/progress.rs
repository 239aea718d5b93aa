use std::time::Instant;

use crate::config::{ScanPhase, ScannerConfig};

/// Converts committed heights into (fraction, eta) progress reports.
pub(crate) struct ProgressTracker<'a> {
    config: &'a ScannerConfig,
    phase: ScanPhase,
    start_height: u32,
    end_height: u32,
    started: Instant,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(
        config: &'a ScannerConfig,
        phase: ScanPhase,
        start_height: u32,
        end_height: u32,
    ) -> Self {
        Self {
            config,
            phase,
            start_height,
            end_height,
            started: Instant::now(),
        }
    }

    pub(crate) fn fraction(&self, height: u32) -> f64 {
        let total = u64::from(self.end_height.saturating_sub(self.start_height)) + 1;
        let done = u64::from(height.saturating_sub(self.start_height)) + 1;
        (done as f64 / total as f64).min(1.0)
    }

    pub(crate) fn update(&self, height: u32) {
        let fraction = self.fraction(height);
        let elapsed = self.started.elapsed().as_secs_f64();
        let eta = if fraction > 0.0 {
            (elapsed * (1.0 - fraction) / fraction).round() as u64
        } else {
            0
        };
        self.config.report(self.phase, fraction, eta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_spans_range() {
        let config = ScannerConfig::default();
        let tracker = ProgressTracker::new(&config, ScanPhase::Scanning, 10, 19);
        assert!((tracker.fraction(10) - 0.1).abs() < 1e-9);
        assert!((tracker.fraction(19) - 1.0).abs() < 1e-9);
        assert!((tracker.fraction(40) - 1.0).abs() < 1e-9);
    }
}
