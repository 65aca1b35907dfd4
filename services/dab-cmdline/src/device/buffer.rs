//! Shared sample FIFO and raw IQ format conversion

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use num_complex::Complex32;

/// Raw IQ encodings produced by the capture tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// rtl_sdr, rtl_tcp, raw files: offset binary, 127.5 = zero
    U8,
    /// hackrf_transfer
    I8,
    /// little endian signed 16 bit
    I16Le,
    /// little endian f32
    F32Le,
}

impl SampleFormat {
    /// Bytes per complex sample
    pub fn frame_size(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::I8 => 2,
            SampleFormat::I16Le => 4,
            SampleFormat::F32Le => 8,
        }
    }

    /// Convert whole samples from `raw`, returning bytes consumed
    pub fn convert(self, raw: &[u8], out: &mut Vec<Complex32>) -> usize {
        let frame = self.frame_size();
        let whole = raw.len() / frame * frame;
        for chunk in raw[..whole].chunks_exact(frame) {
            let sample = match self {
                SampleFormat::U8 => Complex32::new(
                    (chunk[0] as f32 - 127.5) / 127.5,
                    (chunk[1] as f32 - 127.5) / 127.5,
                ),
                SampleFormat::I8 => {
                    Complex32::new(chunk[0] as i8 as f32 / 128.0, chunk[1] as i8 as f32 / 128.0)
                }
                SampleFormat::I16Le => Complex32::new(
                    i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0,
                    i16::from_le_bytes([chunk[2], chunk[3]]) as f32 / 32768.0,
                ),
                SampleFormat::F32Le => Complex32::new(
                    f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                    f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                ),
            };
            out.push(sample);
        }
        whole
    }
}

/// Turns an arbitrary byte stream into complex samples at the engine rate,
/// carrying partial frames over between reads.
#[derive(Debug, Clone)]
pub struct IqDecoder {
    format: SampleFormat,
    pending: Vec<u8>,
    resampler: Option<LinearResampler>,
    scratch: Vec<Complex32>,
}

impl IqDecoder {
    pub fn new(format: SampleFormat, input_rate: u32, output_rate: u32) -> Self {
        let resampler = if input_rate != output_rate {
            Some(LinearResampler::new(input_rate, output_rate))
        } else {
            None
        };
        Self {
            format,
            pending: Vec::new(),
            resampler,
            scratch: Vec::new(),
        }
    }

    pub fn feed(&mut self, raw: &[u8], out: &mut Vec<Complex32>) {
        self.pending.extend_from_slice(raw);
        match self.resampler.as_mut() {
            None => {
                let used = self.format.convert(&self.pending, out);
                self.pending.drain(..used);
            }
            Some(resampler) => {
                self.scratch.clear();
                let used = self.format.convert(&self.pending, &mut self.scratch);
                self.pending.drain(..used);
                resampler.process(&self.scratch, out);
            }
        }
    }
}

/// Bounded FIFO between a reader thread and the engine.
///
/// When full, new samples are dropped rather than blocking the reader.
#[derive(Debug)]
pub struct SampleBuffer {
    samples: Mutex<VecDeque<Complex32>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append samples, returning how many were accepted
    pub fn push(&self, input: &[Complex32]) -> usize {
        let mut samples = match self.samples.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let room = self.capacity - samples.len();
        let accepted = room.min(input.len());
        samples.extend(&input[..accepted]);
        if accepted < input.len() {
            self.dropped
                .fetch_add((input.len() - accepted) as u64, Ordering::Relaxed);
        }
        accepted
    }

    pub fn pop_into(&self, out: &mut [Complex32]) -> usize {
        let mut samples = match self.samples.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let n = out.len().min(samples.len());
        for (slot, sample) in out.iter_mut().zip(samples.drain(..n)) {
            *slot = sample;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
    }

    /// Samples thrown away because the engine fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Linear interpolating rate converter for sources that cannot run at 2.048 MS/s
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    position: f64,
    last: Complex32,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            step: input_rate as f64 / output_rate as f64,
            position: 0.0,
            last: Complex32::new(0.0, 0.0),
        }
    }

    pub fn process(&mut self, input: &[Complex32], out: &mut Vec<Complex32>) {
        // `position` is measured from `last`, i.e. index -1 of `input`
        while self.position < input.len() as f64 {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = if index == 0 { self.last } else { input[index - 1] };
            let b = input[index];
            out.push(a + (b - a) * frac);
            self.position += self.step;
        }
        self.position -= input.len() as f64;
        if let Some(last) = input.last() {
            self.last = *last;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_conversion() {
        let mut out = Vec::new();
        let used = SampleFormat::U8.convert(&[255, 0, 128, 127, 7], &mut out);
        assert_eq!(used, 4);
        assert_eq!(out.len(), 2);
        assert!((out[0].re - 1.0).abs() < 1e-6);
        assert!((out[0].im + 1.0).abs() < 1e-6);
        assert!(out[1].re.abs() < 0.01);
    }

    #[test]
    fn test_i16_conversion() {
        let mut out = Vec::new();
        let raw = [0x00, 0x40, 0x00, 0xC0];
        SampleFormat::I16Le.convert(&raw, &mut out);
        assert_eq!(out, vec![Complex32::new(0.5, -0.5)]);
    }

    #[test]
    fn test_f32_conversion() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0.25f32.to_le_bytes());
        raw.extend_from_slice(&(-0.75f32).to_le_bytes());
        let mut out = Vec::new();
        assert_eq!(SampleFormat::F32Le.convert(&raw, &mut out), 8);
        assert_eq!(out, vec![Complex32::new(0.25, -0.75)]);
    }

    #[test]
    fn test_decoder_keeps_partial_frames() {
        let mut decoder = IqDecoder::new(SampleFormat::I16Le, 2_048_000, 2_048_000);
        let mut out = Vec::new();
        decoder.feed(&[0x00, 0x40, 0x00], &mut out);
        assert!(out.is_empty());
        decoder.feed(&[0xC0], &mut out);
        assert_eq!(out, vec![Complex32::new(0.5, -0.5)]);
    }

    #[test]
    fn test_buffer_drops_when_full() {
        let buffer = SampleBuffer::new(4);
        let samples = vec![Complex32::new(1.0, 0.0); 6];
        assert_eq!(buffer.push(&samples), 4);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.len(), 4);

        let mut out = vec![Complex32::new(0.0, 0.0); 3];
        assert_eq!(buffer.pop_into(&mut out), 3);
        assert_eq!(buffer.len(), 1);
        assert_eq!(out[2], Complex32::new(1.0, 0.0));
    }

    #[test]
    fn test_buffer_partial_pop() {
        let buffer = SampleBuffer::new(16);
        buffer.push(&[Complex32::new(0.5, 0.5)]);
        let mut out = vec![Complex32::new(0.0, 0.0); 8];
        assert_eq!(buffer.pop_into(&mut out), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_resampler_ratio() {
        let mut resampler = LinearResampler::new(2_500_000, 2_048_000);
        let input = vec![Complex32::new(1.0, 0.0); 2_500];
        let mut out = Vec::new();
        for chunk in input.chunks(250) {
            resampler.process(chunk, &mut out);
        }
        // 2500 * 2.048 / 2.5 = 2048, give or take the boundary sample
        assert!((out.len() as i64 - 2048).abs() <= 1, "got {}", out.len());
    }
}
