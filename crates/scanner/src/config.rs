use std::fmt;
use std::sync::Arc;

use crate::error::ScanError;

pub const DEFAULT_LOOKAHEAD: usize = 10;
pub const DEFAULT_FILES_PER_BATCH: u32 = 1;
pub const DEFAULT_BATCHES_PER_LINK: usize = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanPhase {
    Rewinding,
    Scanning,
    Resolving,
}

impl ScanPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanPhase::Rewinding => "rewinding",
            ScanPhase::Scanning => "scanning",
            ScanPhase::Resolving => "resolving",
        }
    }
}

/// Invoked from the commit thread with (phase, fraction done, eta seconds, thread count).
pub type ProgressCallback = Arc<dyn Fn(ScanPhase, f64, u64, usize) + Send + Sync>;

#[derive(Clone)]
pub struct ScannerConfig {
    /// Scan worker threads; also the resolver pool size.
    pub threads: usize,
    /// Block files claimed per batch before overlapping batches are merged.
    pub files_per_batch: u32,
    /// Batches allowed in flight ahead of the oldest uncommitted one.
    pub lookahead: usize,
    /// Batches committed together in one atomic write.
    pub batches_per_link: usize,
    pub report_progress: bool,
    pub progress: Option<ProgressCallback>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self {
            threads,
            files_per_batch: DEFAULT_FILES_PER_BATCH,
            lookahead: DEFAULT_LOOKAHEAD,
            batches_per_link: DEFAULT_BATCHES_PER_LINK,
            report_progress: true,
            progress: None,
        }
    }
}

impl fmt::Debug for ScannerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerConfig")
            .field("threads", &self.threads)
            .field("files_per_batch", &self.files_per_batch)
            .field("lookahead", &self.lookahead)
            .field("batches_per_link", &self.batches_per_link)
            .field("report_progress", &self.report_progress)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ScannerConfig {
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.threads == 0 {
            return Err(ScanError::Config("threads must be at least 1"));
        }
        if self.files_per_batch == 0 {
            return Err(ScanError::Config("files_per_batch must be at least 1"));
        }
        if self.batches_per_link == 0 {
            return Err(ScanError::Config("batches_per_link must be at least 1"));
        }
        if self.lookahead < self.batches_per_link {
            return Err(ScanError::Config(
                "lookahead must cover at least one full link",
            ));
        }
        Ok(())
    }

    pub(crate) fn report(&self, phase: ScanPhase, fraction: f64, eta_secs: u64) {
        if !self.report_progress {
            return;
        }
        if let Some(callback) = &self.progress {
            callback(phase, fraction.clamp(0.0, 1.0), eta_secs, self.threads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ScannerConfig::default();
        assert_eq!(config.lookahead, DEFAULT_LOOKAHEAD);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lookahead_must_hold_a_link() {
        let config = ScannerConfig {
            lookahead: 1,
            batches_per_link: 2,
            ..ScannerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));
    }

    #[test]
    fn report_respects_flag() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut config = ScannerConfig::default().with_progress(Arc::new(move |_, _, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        config.report(ScanPhase::Scanning, 0.5, 1);
        config.report_progress = false;
        config.report(ScanPhase::Scanning, 0.6, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
