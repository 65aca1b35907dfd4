//! Replay of previously captured samples from raw or WAV files

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use num_complex::Complex32;
use tracing::{debug, error, info};

use super::buffer::{IqDecoder, SampleBuffer, SampleFormat};
use super::{DeviceError, DeviceHandler, BUFFER_CAPACITY, SAMPLE_RATE};

/// Samples delivered per pacing step (50 ms of signal)
const CHUNK: usize = SAMPLE_RATE as usize / 20;

/// A seekable source of complex samples
pub trait IqReader: Send + 'static {
    /// Append up to `max` samples to `out`; 0 means end of file
    fn read_chunk(&mut self, out: &mut Vec<Complex32>, max: usize) -> std::io::Result<usize>;

    fn rewind(&mut self) -> std::io::Result<()>;

    fn describe(&self) -> String;
}

/// 8-bit unsigned interleaved IQ, as written by rtl_sdr
pub struct RawIqReader {
    file: BufReader<File>,
    decoder: IqDecoder,
    raw: Vec<u8>,
    path: String,
}

impl RawIqReader {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let file = File::open(path).map_err(|e| DeviceError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            file: BufReader::new(file),
            decoder: IqDecoder::new(SampleFormat::U8, SAMPLE_RATE, SAMPLE_RATE),
            raw: Vec::new(),
            path: path.display().to_string(),
        })
    }
}

impl IqReader for RawIqReader {
    fn read_chunk(&mut self, out: &mut Vec<Complex32>, max: usize) -> std::io::Result<usize> {
        self.raw.resize(max * SampleFormat::U8.frame_size(), 0);
        let before = out.len();
        // a short read may end mid-sample; keep going until a sample or EOF
        while out.len() == before {
            let n = self.file.read(&mut self.raw)?;
            if n == 0 {
                break;
            }
            self.decoder.feed(&self.raw[..n], out);
        }
        Ok(out.len() - before)
    }

    fn rewind(&mut self) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("raw file {}", self.path)
    }
}

/// Two channel (I, Q) 16-bit WAV
pub struct WavIqReader {
    reader: hound::WavReader<BufReader<File>>,
    path: String,
}

impl WavIqReader {
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let open_err = |reason: String| DeviceError::Open {
            path: path.to_path_buf(),
            reason,
        };
        let reader = hound::WavReader::open(path).map_err(|e| open_err(e.to_string()))?;
        let spec = reader.spec();
        if spec.channels != 2
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(open_err(format!(
                "expected 2 channel 16 bit PCM, found {} channel {} bit {:?}",
                spec.channels, spec.bits_per_sample, spec.sample_format
            )));
        }
        if spec.sample_rate != SAMPLE_RATE {
            info!(
                "{} is recorded at {} S/s, replaying as {} S/s",
                path.display(),
                spec.sample_rate,
                SAMPLE_RATE
            );
        }
        Ok(Self {
            reader,
            path: path.display().to_string(),
        })
    }
}

impl IqReader for WavIqReader {
    fn read_chunk(&mut self, out: &mut Vec<Complex32>, max: usize) -> std::io::Result<usize> {
        let mut samples = self.reader.samples::<i16>();
        let mut count = 0;
        while count < max {
            let (i, q) = match (samples.next(), samples.next()) {
                (Some(i), Some(q)) => (i, q),
                _ => break,
            };
            let i = i.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let q = q.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            out.push(Complex32::new(i as f32 / 32768.0, q as f32 / 32768.0));
            count += 1;
        }
        Ok(count)
    }

    fn rewind(&mut self) -> std::io::Result<()> {
        self.reader.seek(0)
    }

    fn describe(&self) -> String {
        format!("wav file {}", self.path)
    }
}

/// Plays an [`IqReader`] into the sample buffer in real time
pub struct FileReplay {
    source: Arc<Mutex<Box<dyn IqReader>>>,
    repeat: bool,
    name: String,
    buffer: Arc<SampleBuffer>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileReplay {
    pub fn new<R: IqReader>(source: R, repeat: bool) -> Self {
        let name = source.describe();
        Self {
            source: Arc::new(Mutex::new(Box::new(source))),
            repeat,
            name,
            buffer: Arc::new(SampleBuffer::new(BUFFER_CAPACITY)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl DeviceHandler for FileReplay {
    /// Files are not tuned; the frequency is ignored
    fn restart_reader(&self, _frequency: u32) -> Result<(), DeviceError> {
        if self.is_running() {
            return Ok(());
        }
        self.stop_reader();

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let buffer = self.buffer.clone();
        let source = self.source.clone();
        let repeat = self.repeat;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name("file-replay".to_string())
            .spawn(move || {
                let period = Duration::from_secs_f64(CHUNK as f64 / SAMPLE_RATE as f64);
                let mut next = Instant::now();
                let mut chunk: Vec<Complex32> = Vec::with_capacity(CHUNK);
                let mut delivered = false;
                let mut source = match source.lock() {
                    Ok(s) => s,
                    Err(poisoned) => poisoned.into_inner(),
                };
                while running.load(Ordering::SeqCst) {
                    chunk.clear();
                    match source.read_chunk(&mut chunk, CHUNK) {
                        Ok(0) if repeat && delivered => {
                            delivered = false;
                            debug!("End of {}, restarting", name);
                            if let Err(e) = source.rewind() {
                                error!("Cannot rewind {}: {}", name, e);
                                break;
                            }
                            continue;
                        }
                        Ok(0) => {
                            info!("End of file reached: {}", name);
                            break;
                        }
                        Ok(_) => {
                            delivered = true;
                            buffer.push(&chunk);
                        }
                        Err(e) => {
                            error!("Error reading {}: {}", name, e);
                            break;
                        }
                    }
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
                running.store(false, Ordering::SeqCst);
            })?;

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
        Ok(())
    }

    fn stop_reader(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn get_samples(&self, out: &mut [Complex32]) -> usize {
        self.buffer.pop_into(out)
    }

    fn samples(&self) -> usize {
        self.buffer.len()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FileReplay {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for(replay: &FileReplay, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while replay.samples() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_raw_reader_converts_u8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.raw");
        std::fs::write(&path, [255u8, 0, 128, 128, 0]).unwrap();

        let mut reader = RawIqReader::open(&path).unwrap();
        let mut out = Vec::new();
        assert_eq!(reader.read_chunk(&mut out, 16).unwrap(), 2);
        assert_eq!(reader.read_chunk(&mut out, 16).unwrap(), 0);
        reader.rewind().unwrap();
        assert_eq!(reader.read_chunk(&mut out, 16).unwrap(), 2);
    }

    #[test]
    fn test_wav_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [16384i16, -16384, 0, 8192] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = WavIqReader::open(&path).unwrap();
        let mut out = Vec::new();
        assert_eq!(reader.read_chunk(&mut out, 10).unwrap(), 2);
        assert_eq!(out[0], Complex32::new(0.5, -0.5));
        assert_eq!(out[1], Complex32::new(0.0, 0.25));
        reader.rewind().unwrap();
        assert_eq!(reader.read_chunk(&mut out, 1).unwrap(), 1);
    }

    #[test]
    fn test_wav_rejects_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();
        assert!(matches!(WavIqReader::open(&path), Err(DeviceError::Open { .. })));
    }

    #[test]
    fn test_replay_without_repeat_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.raw");
        std::fs::write(&path, vec![128u8; 200]).unwrap();

        let replay = FileReplay::new(RawIqReader::open(&path).unwrap(), false);
        replay.restart_reader(0).unwrap();
        wait_for(&replay, 100);
        assert_eq!(replay.samples(), 100);

        let deadline = Instant::now() + Duration::from_secs(5);
        while replay.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!replay.is_running());
        replay.stop_reader();
    }

    #[test]
    fn test_replay_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.raw");
        std::fs::write(&path, vec![128u8; 20]).unwrap();

        let replay = FileReplay::new(RawIqReader::open(&path).unwrap(), true);
        replay.restart_reader(0).unwrap();
        wait_for(&replay, 30);
        assert!(replay.samples() >= 30);
        replay.stop_reader();
        assert!(!replay.is_running());
    }
}
