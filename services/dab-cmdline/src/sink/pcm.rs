//! PCM audio output on stdout
//!
//! Samples are written as native-endian interleaved i16. With the
//! streamer enabled, buffers are handed to a writer thread that keeps the
//! output in step with the wall clock, filling real gaps with silence.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error, warn};

/// Poll interval of the streamer, and the lag it tolerates before filling
pub const GAP: Duration = Duration::from_millis(100);

/// Buffers queued for the streamer before new ones are dropped
const QUEUE_DEPTH: usize = 64;

/// Remembers the last announced format
#[derive(Debug, Default)]
pub struct FormatTracker {
    last: Option<(u32, bool)>,
}

impl FormatTracker {
    /// True on the first call and whenever rate or channel count change
    pub fn update(&mut self, rate: u32, stereo: bool) -> bool {
        if self.last == Some((rate, stereo)) {
            return false;
        }
        self.last = Some((rate, stereo));
        true
    }
}

pub fn encode(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_ne_bytes());
    }
}

/// Writes each buffer straight through and flushes
pub struct DirectOutput<W: Write> {
    out: W,
    scratch: Vec<u8>,
}

impl<W: Write> DirectOutput<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            scratch: Vec::new(),
        }
    }

    pub fn write(&mut self, samples: &[i16]) -> io::Result<()> {
        encode(samples, &mut self.scratch);
        self.out.write_all(&self.scratch)?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

struct Block {
    samples: Vec<i16>,
    rate: u32,
    channels: u32,
}

/// Samples owed to the output since the first buffer in the current format
struct Pace {
    start: Instant,
    rate: u32,
    channels: u32,
    written: u64,
}

impl Pace {
    fn new(rate: u32, channels: u32, start: Instant) -> Self {
        Self {
            start,
            rate,
            channels,
            written: 0,
        }
    }

    fn matches(&self, rate: u32, channels: u32) -> bool {
        self.rate == rate && self.channels == channels
    }

    fn samples_in(&self, span: Duration) -> u64 {
        (self.rate as u128 * self.channels as u128 * span.as_micros() / 1_000_000) as u64
    }

    /// Interleaved samples of silence needed to catch up with `now`;
    /// zero while the output lags by no more than one GAP
    fn shortfall(&self, now: Instant) -> usize {
        let expected = self.samples_in(now.saturating_duration_since(self.start));
        let behind = expected.saturating_sub(self.written);
        if behind <= self.samples_in(GAP) {
            return 0;
        }
        (behind - behind % self.channels.max(1) as u64) as usize
    }
}

/// Gap-filling writer thread
pub struct Streamer {
    tx: Option<Sender<Block>>,
    worker: Option<JoinHandle<()>>,
    dropped: AtomicU64,
}

impl Streamer {
    pub fn spawn<W: Write + Send + 'static>(out: W) -> io::Result<Self> {
        let (tx, rx) = bounded::<Block>(QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("pcm-streamer".to_string())
            .spawn(move || {
                let mut output = DirectOutput::new(out);
                let mut pace: Option<Pace> = None;
                let mut silence: Vec<i16> = Vec::new();
                loop {
                    match rx.recv_timeout(GAP) {
                        Ok(block) => {
                            if !pace.as_ref().is_some_and(|p| p.matches(block.rate, block.channels)) {
                                pace = Some(Pace::new(block.rate, block.channels, Instant::now()));
                            }
                            if let Err(e) = output.write(&block.samples) {
                                error!("PCM: write error ({})", e);
                                break;
                            }
                            if let Some(p) = pace.as_mut() {
                                p.written += block.samples.len() as u64;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            // nothing to fill before the format is known
                            let Some(p) = pace.as_mut() else { continue };
                            let missing = p.shortfall(Instant::now());
                            if missing == 0 {
                                continue;
                            }
                            silence.clear();
                            silence.resize(missing, 0);
                            if let Err(e) = output.write(&silence) {
                                error!("PCM: write error ({})", e);
                                break;
                            }
                            p.written += missing as u64;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("PCM streamer finished");
            })?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Queue a buffer without blocking; a full queue drops it
    pub fn add_buffer(&self, samples: &[i16], rate: u32, stereo: bool) {
        let Some(tx) = &self.tx else { return };
        let block = Block {
            samples: samples.to_vec(),
            rate,
            channels: if stereo { 2 } else { 1 },
        };
        match tx.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("PCM streamer cannot keep up, dropping audio");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub enum PcmOutput {
    Direct(Mutex<DirectOutput<Box<dyn Write + Send>>>),
    Streamed(Streamer),
}

impl PcmOutput {
    pub fn stdout() -> Self {
        let out: Box<dyn Write + Send> = Box::new(io::stdout());
        PcmOutput::Direct(Mutex::new(DirectOutput::new(out)))
    }

    pub fn streamed_stdout() -> io::Result<Self> {
        Ok(PcmOutput::Streamed(Streamer::spawn(io::stdout())?))
    }

    pub fn write(&self, samples: &[i16], rate: u32, stereo: bool) -> io::Result<()> {
        match self {
            PcmOutput::Direct(out) => match out.lock() {
                Ok(mut out) => out.write(samples),
                Err(poisoned) => poisoned.into_inner().write(samples),
            },
            PcmOutput::Streamed(streamer) => {
                if streamer.is_running() {
                    streamer.add_buffer(samples, rate, stereo);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct Shared(Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Shared {
        fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    #[test]
    fn test_format_tracker() {
        let mut tracker = FormatTracker::default();
        assert!(tracker.update(48_000, true));
        assert!(!tracker.update(48_000, true));
        assert!(tracker.update(32_000, true));
        assert!(tracker.update(32_000, false));
        assert!(!tracker.update(32_000, false));
    }

    #[test]
    fn test_direct_output_native_endian() {
        let mut out = DirectOutput::new(Vec::new());
        out.write(&[1, -2]).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&1i16.to_ne_bytes());
        expected.extend_from_slice(&(-2i16).to_ne_bytes());
        assert_eq!(out.into_inner(), expected);
    }

    #[test]
    fn test_streamer_passes_audio_through() {
        let shared = Shared::default();
        let streamer = Streamer::spawn(shared.clone()).unwrap();
        streamer.add_buffer(&[7; 480], 48_000, true);
        drop(streamer);
        assert!(shared.len() >= 960);
        assert_eq!(&shared.0.lock().unwrap()[..2], &7i16.to_ne_bytes());
    }

    #[test]
    fn test_pace_shortfall() {
        let t0 = Instant::now();
        let mut pace = Pace::new(48_000, 2, t0);
        // one GAP of lag is tolerated
        assert_eq!(pace.shortfall(t0 + Duration::from_millis(100)), 0);
        assert_eq!(pace.shortfall(t0 + Duration::from_millis(150)), 14_400);

        // a 120 ms burst covers the wait for the next one
        pace.written = 11_520;
        assert_eq!(pace.shortfall(t0 + Duration::from_millis(200)), 0);
        assert_eq!(pace.shortfall(t0 + Duration::from_millis(220)), 0);
        assert_eq!(pace.shortfall(t0 + Duration::from_millis(300)), 17_280);
        assert_eq!(pace.shortfall(t0.checked_sub(Duration::from_secs(1)).unwrap_or(t0)), 0);

        let mono = Pace::new(22_050, 1, t0);
        assert_eq!(mono.shortfall(t0 + Duration::from_secs(1)), 22_050);
    }

    #[test]
    fn test_streamer_keeps_bursty_audio_continuous() {
        let shared = Shared::default();
        let streamer = Streamer::spawn(shared.clone()).unwrap();

        // five 24 ms AAC frames of 48 kHz stereo every 120 ms
        let frame = [3i16; 1152 * 2];
        let started = Instant::now();
        for cycle in 0..10u32 {
            let due = started + Duration::from_millis(120) * cycle;
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            for _ in 0..5 {
                streamer.add_buffer(&frame, 48_000, true);
            }
        }
        drop(streamer);

        let audio_bytes = 10 * 5 * frame.len() * 2;
        let total = shared.len();
        assert!(total >= audio_bytes);
        // allow one GAP of scheduling slack, far below the 120 ms per cycle
        // that idle-time filling would add
        assert!(
            total <= audio_bytes + 9600 * 2,
            "{} bytes for {} bytes of audio",
            total,
            audio_bytes
        );
    }

    #[test]
    fn test_streamer_fills_gaps_with_silence() {
        let shared = Shared::default();
        let streamer = Streamer::spawn(shared.clone()).unwrap();
        streamer.add_buffer(&[1; 4], 48_000, true);

        // once the lag passes one GAP, the whole shortfall is filled;
        // 100 ms of 48 kHz stereo is 9600 samples
        let deadline = Instant::now() + Duration::from_secs(5);
        while shared.len() < 8 + 9600 * 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        drop(streamer);
        let bytes = shared.0.lock().unwrap().clone();
        assert!(bytes.len() >= 8 + 9600 * 2);
        assert!(bytes[8..8 + 9600 * 2].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_streamer_silent_before_first_buffer() {
        let shared = Shared::default();
        let streamer = Streamer::spawn(shared.clone()).unwrap();
        thread::sleep(GAP * 3);
        assert!(streamer.is_running());
        drop(streamer);
        assert_eq!(shared.len(), 0);
    }
}
