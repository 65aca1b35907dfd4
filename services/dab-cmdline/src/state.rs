//! Runtime flags shared between engine callbacks and the control loop

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

/// Reception quality as last reported by the engine
#[derive(Debug, Default)]
pub struct QualityStats {
    pub snr: AtomicI32,
    pub freq_offset: AtomicI32,
    pub fib_quality: AtomicI32,
    pub frame_errors: AtomicI32,
    pub rs_errors: AtomicI32,
    pub aac_errors: AtomicI32,
    pub pcm_samples: AtomicU64,
    pub labels_written: AtomicU64,
    pub slides_written: AtomicU64,
}

impl QualityStats {
    pub fn record_system(&self, snr: i16, freq_offset: i32) {
        self.snr.store(snr as i32, Ordering::Relaxed);
        self.freq_offset.store(freq_offset, Ordering::Relaxed);
    }

    pub fn record_fib(&self, quality: i16) {
        self.fib_quality.store(quality as i32, Ordering::Relaxed);
    }

    pub fn record_msc(&self, frame_errors: i16, rs_errors: i16, aac_errors: i16) {
        self.frame_errors.store(frame_errors as i32, Ordering::Relaxed);
        self.rs_errors.store(rs_errors as i32, Ordering::Relaxed);
        self.aac_errors.store(aac_errors as i32, Ordering::Relaxed);
    }

    pub fn record_pcm(&self, samples: usize) {
        self.pcm_samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_label(&self) {
        self.labels_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slide(&self) {
        self.slides_written.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for QualityStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snr={} offset={} Hz | fic={}% | msc errors fe={} rs={} aac={} | pcm={} labels={} slides={}",
            self.snr.load(Ordering::Relaxed),
            self.freq_offset.load(Ordering::Relaxed),
            self.fib_quality.load(Ordering::Relaxed),
            self.frame_errors.load(Ordering::Relaxed),
            self.rs_errors.load(Ordering::Relaxed),
            self.aac_errors.load(Ordering::Relaxed),
            self.pcm_samples.load(Ordering::Relaxed),
            self.labels_written.load(Ordering::Relaxed),
            self.slides_written.load(Ordering::Relaxed),
        )
    }
}

/// Independent flags; no invariant spans more than one of them.
#[derive(Debug, Default)]
pub struct RadioState {
    time_synced: AtomicBool,
    timesync_set: AtomicBool,
    ensemble_recognized: AtomicBool,
    run: AtomicBool,
    interrupted: AtomicBool,
    pub quality: QualityStats,
}

impl RadioState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_time_sync(&self, synced: bool) {
        self.time_synced.store(synced, Ordering::SeqCst);
        self.timesync_set.store(true, Ordering::SeqCst);
    }

    pub fn time_synced(&self) -> bool {
        self.time_synced.load(Ordering::SeqCst)
    }

    /// True once the engine has reported any sync attempt
    pub fn timesync_set(&self) -> bool {
        self.timesync_set.load(Ordering::SeqCst)
    }

    pub fn set_ensemble_recognized(&self) {
        self.ensemble_recognized.store(true, Ordering::SeqCst);
    }

    pub fn ensemble_recognized(&self) -> bool {
        self.ensemble_recognized.load(Ordering::SeqCst)
    }

    /// Clear the acquisition flags before processing starts
    pub fn reset_acquisition(&self) {
        self.timesync_set.store(false, Ordering::SeqCst);
        self.ensemble_recognized.store(false, Ordering::SeqCst);
    }

    pub fn set_running(&self, run: bool) {
        self.run.store(run, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Termination request from a signal; sticky for the rest of the process
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.run.store(false, Ordering::SeqCst);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_sync_sets_both_flags() {
        let state = RadioState::new();
        assert!(!state.timesync_set());
        state.set_time_sync(false);
        assert!(state.timesync_set());
        assert!(!state.time_synced());
        state.set_time_sync(true);
        assert!(state.time_synced());
    }

    #[test]
    fn test_interrupt_clears_run() {
        let state = RadioState::new();
        state.set_running(true);
        state.interrupt();
        assert!(!state.is_running());
        assert!(state.interrupted());
    }

    #[test]
    fn test_reset_acquisition() {
        let state = RadioState::new();
        state.set_time_sync(true);
        state.set_ensemble_recognized();
        state.reset_acquisition();
        assert!(!state.timesync_set());
        assert!(!state.ensemble_recognized());
        // the sync result itself is left alone
        assert!(state.time_synced());
    }

    #[test]
    fn test_quality_display() {
        let stats = QualityStats::default();
        stats.record_system(12, -250);
        stats.record_fib(100);
        stats.record_msc(1, 2, 3);
        let line = stats.to_string();
        assert!(line.contains("snr=12"));
        assert!(line.contains("fic=100%"));
        assert!(line.contains("fe=1 rs=2 aac=3"));
    }
}
